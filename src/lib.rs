pub mod error;
pub mod fetcher;
pub mod interpreter;
pub mod lockfile;
pub mod observability;
pub mod platform;
pub mod recipe;
pub mod registry;
pub mod resolver;
pub mod sbom;
pub mod steps;
pub mod testrunner;
pub mod validation;

pub use error::{Error, Result};
pub use interpreter::{BuildOptions, BuildOutcome, Interpreter};
pub use recipe::Recipe;
pub use registry::Registry;
