mod listeners;
mod store;
mod value;

pub use listeners::{ChangeListener, ListenerId, ListenerRegistry};
pub use store::{clear_first, Edit, Editor, InMemoryPreferenceStore, PreferenceStore, PrefsError};
pub use value::{PrefType, PrefValue};
