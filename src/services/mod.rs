pub mod code_allocator;
pub mod controller;
pub mod documentation;
pub mod health_service;
pub mod identity_service;
pub mod session_service;
pub mod storage_supervisor;
pub mod websocket_service;
