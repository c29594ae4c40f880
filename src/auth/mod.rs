pub mod context;
pub mod guard;

// Re-export public items
pub use context::{Actor, Scope};
pub use guard::{ActorProvider, AllowAllGuard, ContextActorProvider, ExportGuard, RoleGuard};
