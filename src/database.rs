pub mod course;
pub mod participant;
pub mod postgres_repository;
pub mod session;
