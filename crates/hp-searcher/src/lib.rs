//! # hp-searcher
//!
//! The searcher side of an hp experiment.
//!
//! A [`Searcher`] wraps one [`SearchMethod`] and turns trial lifecycle events
//! into [`Operation`](hp_types::Operation)s. Sweep methods (random, grid)
//! decide locally; [`CustomSearch`] records every event in a
//! [`SearcherEventQueue`] for an external client and decides nothing itself.

mod custom;
mod method;
mod queue;
mod sampling;
mod searcher;
mod sweep;

pub use custom::{CustomSearch, CUSTOM_SEARCH_DEFAULT_PROGRESS};
pub use method::{new_search_method, SearchContext, SearchMethod, SearchMethodType, SearcherResult};
pub use queue::SearcherEventQueue;
pub use sampling::{grid_points, sample_hparams};
pub use searcher::{Searcher, SearcherState};
pub use sweep::SweepSearch;
