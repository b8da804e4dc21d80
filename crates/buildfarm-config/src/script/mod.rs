//! The build-script language.

pub mod changes;
pub mod expand;
pub mod interpreter;
pub mod keywords;
pub mod label;
pub mod state;
pub mod tokenize;

pub use expand::ExpansionContext;
pub use interpreter::{Parsed, ScriptInterpreter};
pub use label::{LabelInfo, RevisionType};
pub use state::{RunFlags, ScriptState};
pub use tokenize::extract_parameters;
