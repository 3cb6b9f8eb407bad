//! # OpenJules
//!
//! An autonomous software-engineering agent: given a natural-language goal
//! and an optional source repository, it plans a sequence of shell actions,
//! executes each action inside an isolated container sandbox, and persists
//! every transition so execution survives restarts and human gating.
//!
//! This crate is the mission runtime:
//! - the mission state machine and controller loop
//! - the command guard that filters every shell command
//! - the Docker sandbox driver (foreground and background execution)
//! - the LLM role gateway (planner, coder, troubleshooter, guard)
//!
//! The multi-tenant CRUD surface, transport and database migrations live in
//! external collaborators; they reach this crate through the [`store::Store`]
//! trait, [`llm::LlmClient`] and [`sandbox::SandboxHost`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use openjules::{
//!     config::Config,
//!     llm::HttpLlmClient,
//!     mission::{MissionController, MissionRuntime},
//!     sandbox::DockerDriver,
//!     store::InMemoryStore,
//! };
//!
//! let config = Config::from_env()?;
//! let store = Arc::new(InMemoryStore::new());
//! let driver = Arc::new(DockerDriver::connect(config)?);
//! let controller = Arc::new(MissionController::new(store, Arc::new(HttpLlmClient::new()), driver));
//! let runtime = MissionRuntime::new(controller, 4);
//! runtime.dispatch(job_id).await;
//! ```

pub mod config;
pub mod guard;
pub mod llm;
pub mod mission;
pub mod model;
pub mod sandbox;
pub mod settings;
pub mod store;

pub use config::Config;
