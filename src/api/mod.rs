pub mod ingest;
pub mod insights_api;
pub mod routes;
pub mod signals_api;
pub mod simulation_api;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
