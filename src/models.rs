pub mod course;
pub mod flow;
pub mod health;
pub mod participant;
pub mod scan;
pub mod session;
