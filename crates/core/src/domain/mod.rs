pub mod context;
pub mod entity;
pub mod instance;
pub mod template;
