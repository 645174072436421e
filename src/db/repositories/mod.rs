pub mod work_sessions;
