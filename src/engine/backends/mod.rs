pub mod stub;

#[cfg(feature = "engine-tract")]
pub mod tract;

pub use stub::StubEngine;

#[cfg(feature = "engine-tract")]
pub use tract::TractEngine;
