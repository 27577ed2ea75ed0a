pub mod episode;
pub mod error;
pub mod machine;
pub mod participant;
pub mod reconcile;

pub use episode::{Episode, EpisodeStore, InMemoryEpisodeStore};
pub use error::LifecycleError;
pub use machine::{CallDirector, DirectorConfig};
pub use participant::{transition_allowed, CallerState, Participant, StateChange};
pub use reconcile::{Reconciler, ReconcilerConfig};
