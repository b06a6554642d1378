pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod events;
pub mod experiment;
pub mod hparams;
pub mod ids;
pub mod job;
pub mod operations;

pub use checkpoint::*;
pub use config::*;
pub use errors::*;
pub use events::*;
pub use experiment::*;
pub use hparams::*;
pub use ids::*;
pub use job::*;
pub use operations::*;
