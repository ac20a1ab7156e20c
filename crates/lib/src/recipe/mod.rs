//! Declarative recipes: the structured data describing one buildable library.

mod load;
mod types;

pub use load::{load_dir, load_file, parse_recipes};
pub use types::*;
