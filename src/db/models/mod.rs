pub mod work_session;

pub use work_session::{NewWorkSession, SessionUpdate, StopFields, WorkSession};
