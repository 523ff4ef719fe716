pub mod errors;
pub mod events;
pub mod ids;
pub mod stream;
pub mod tools;
pub mod turns;
