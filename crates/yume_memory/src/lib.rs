pub mod emotional;
pub mod snapshot;
pub mod state;

pub use emotional::{ConversationPattern, EmotionalMemory, Interaction};
pub use snapshot::{JsonDirStore, KvStore, MemoryStore, Snapshot, SnapshotWriter};
pub use state::{StateMachine, UserStatus};
