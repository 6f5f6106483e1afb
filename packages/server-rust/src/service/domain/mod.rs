//! The subsystem table.
//!
//! Subsystems whose behavior lives outside this crate (chat, tournaments,
//! moderation, ...) are registered as lifecycle placeholders so the boot
//! order and dependency checks still cover them. The rest have real state
//! in the sibling modules.

use async_trait::async_trait;
use tracing::debug;

use crate::service::registry::{ManagedService, ServiceContext};

pub mod dnsbl;
pub mod formats;
pub mod ladders;
pub mod pools;
pub mod rooms;
pub mod users;

pub use dnsbl::{DnsblService, IpRange};
pub use formats::{FormatInfo, FormatsService};
pub use ladders::{LadderBackend, LaddersService};
pub use pools::{ValidatorService, VerifierService};
pub use rooms::RoomsService;
pub use users::{GroupCache, GroupInfo, UsersService};

/// Registry names, in boot order.
pub mod names {
    pub const MONITOR: &str = "monitor";
    pub const TOOLS: &str = "tools";
    pub const LOGIN_SERVER: &str = "loginserver";
    pub const LADDERS: &str = "ladders";
    pub const USERS: &str = "users";
    pub const PUNISHMENTS: &str = "punishments";
    pub const CHAT: &str = "chat";
    pub const ROOMS: &str = "rooms";
    pub const VERIFIER: &str = "verifier";
    pub const TOURNAMENTS: &str = "tournaments";
    pub const DNSBL: &str = "dnsbl";
    pub const FORMATS: &str = "formats";
    pub const VALIDATOR: &str = "validator";
    pub const CONSOLE: &str = "console";
}

// ---------------------------------------------------------------------------
// External subsystems
// ---------------------------------------------------------------------------

/// Generate a placeholder subsystem with the given name and dependencies.
macro_rules! external_subsystem {
    (
        $(#[$meta:meta])*
        $name:ident, $svc_name:expr, [$($dep:expr),* $(,)?]
    ) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name;

        #[async_trait]
        impl ManagedService for $name {
            fn name(&self) -> &'static str {
                $svc_name
            }

            fn dependencies(&self) -> &'static [&'static str] {
                &[$($dep),*]
            }

            async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
                debug!(subsystem = $svc_name, "external subsystem bound");
                Ok(())
            }

            async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
                Ok(())
            }
        }
    };
}

external_subsystem!(
    /// Abuse and activity monitor.
    MonitorService, names::MONITOR, []
);

external_subsystem!(
    /// Shared game data and utility helpers.
    ToolsService, names::TOOLS, []
);

external_subsystem!(
    /// Identity and session service client.
    LoginServerService, names::LOGIN_SERVER, [names::TOOLS]
);

external_subsystem!(
    /// Moderation registry.
    PunishmentsService, names::PUNISHMENTS, [names::USERS]
);

external_subsystem!(
    /// Chat command engine.
    ChatService, names::CHAT, [names::USERS, names::PUNISHMENTS]
);

external_subsystem!(
    /// Tournament engine.
    TournamentsService, names::TOURNAMENTS, [names::ROOMS]
);
