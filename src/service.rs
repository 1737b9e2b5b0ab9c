pub mod field_collector;
pub mod lifecycle;
pub mod messenger;
pub mod notifier;
pub mod scanner;

use crate::database::postgres_repository::PostgresRepository;

pub type SessionNotifier = notifier::ChangeNotifier<PostgresRepository>;
pub type SessionLifecycle = lifecycle::LifecycleMachine<PostgresRepository>;
pub type SessionScanner = scanner::ProximityScanner<PostgresRepository>;
