#![forbid(unsafe_code)]

//! Fixtures and helpers shared by the cross-crate property tests and
//! end-to-end scenarios under `tests/`.

use tf_frame::{DataFrame, record};
use tf_types::Scalar;
use tracing_subscriber::{EnvFilter, FmtSubscriber, filter::LevelFilter};

/// Install a test-writer subscriber once per process. `RUST_LOG` overrides
/// the default `warn` level. Later calls are no-ops.
pub fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_test_writer()
        .with_env_filter(env_filter)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Nine characters: six humans with masses `[77, 136, 120, 75, 84, 77]` and
/// three droids with masses `[75, 32, 32]`, interleaved.
#[must_use]
pub fn characters() -> DataFrame {
    DataFrame::from_records(vec![
        record! { "name" => "Luke Skywalker", "species" => "Human", "homeworld" => "Tatooine", "height" => 172, "mass" => 77 },
        record! { "name" => "C-3PO", "species" => "Droid", "homeworld" => "Tatooine", "height" => 167, "mass" => 75 },
        record! { "name" => "R2-D2", "species" => "Droid", "homeworld" => "Naboo", "height" => 96, "mass" => 32 },
        record! { "name" => "Darth Vader", "species" => "Human", "homeworld" => "Tatooine", "height" => 202, "mass" => 136 },
        record! { "name" => "Owen Lars", "species" => "Human", "homeworld" => "Tatooine", "height" => 178, "mass" => 120 },
        record! { "name" => "Beru Whitesun Lars", "species" => "Human", "homeworld" => "Tatooine", "height" => 165, "mass" => 75 },
        record! { "name" => "R5-D4", "species" => "Droid", "homeworld" => "Tatooine", "height" => 97, "mass" => 32 },
        record! { "name" => "Biggs Darklighter", "species" => "Human", "homeworld" => "Tatooine", "height" => 183, "mass" => 84 },
        record! { "name" => "Obi-Wan Kenobi", "species" => "Human", "homeworld" => "Stewjon", "height" => 182, "mass" => 77 },
    ])
}

/// Planet lookup for joins. Stewjon is absent and Alderaan has no
/// character.
#[must_use]
pub fn planets() -> DataFrame {
    DataFrame::from_records(vec![
        record! { "homeworld" => "Tatooine", "climate" => "arid" },
        record! { "homeworld" => "Naboo", "climate" => "temperate" },
        record! { "homeworld" => "Alderaan", "climate" => "temperate" },
    ])
}

/// Rows with gaps: a null mass, a missing species and a NaN.
#[must_use]
pub fn with_gaps() -> DataFrame {
    DataFrame::from_records(vec![
        record! { "name" => "Leia Organa", "species" => "Human", "mass" => 49.0 },
        record! { "name" => "Yoda", "species" => Scalar::null(), "mass" => 17.0 },
        record! { "name" => "Jabba", "species" => "Hutt", "mass" => Scalar::null() },
        record! { "name" => "Greedo", "species" => "Rodian", "mass" => f64::NAN },
    ])
}

/// Text rendering of one column, for compact assertions.
#[must_use]
pub fn column_text(frame: &DataFrame, name: &str) -> Vec<String> {
    frame
        .iter_column(name)
        .map(|values| values.map(ToString::to_string).collect())
        .unwrap_or_default()
}
