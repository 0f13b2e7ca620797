mod build;
mod deployment;
mod webhook;

pub use build::*;
pub use deployment::*;
pub use webhook::*;
