/// Warm TTL cache of live sessions keyed by join code.
pub mod cache;
/// Database model definitions.
pub mod models;
/// Read-side of quizzes consumed by session controllers.
pub mod quiz_catalog;
/// Durable record of sessions, participants and answers.
pub mod session_store;
/// Storage errors, deadlines and retry helpers.
pub mod storage;
