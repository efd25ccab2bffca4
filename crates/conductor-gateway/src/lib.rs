//! # Conductor Gateway
//!
//! HTTP surface for the scheduling core.
//!
//! - `POST /api/jobs`, `/api/tasks`, `/api/webhook` → intent dispatch
//! - `GET /api/jobs`, `GET|DELETE /api/jobs/{id}`, `PUT /api/jobs/{id}/schedule`
//! - `GET /api/stats`, `GET /api/events`
//!
//! `/api` routes need the pairing code. `POST /api/verify-pairing`,
//! `GET /metrics` and `GET /health` are public.

pub mod routes;
pub mod server;

pub use server::{AppState, PAIRING_HEADER, build_router, resolve_pairing_code, start};
