//! Email client commands

use anyhow::Result;
use clap::Subcommand;
use mailproof_common::{presets, EmailClient};
use serde::Serialize;

use super::Context;
use crate::output::{
    or_dash, print_details, print_item, print_list, print_serialized, print_success, OutputFormat,
    TableDisplay,
};

#[derive(Subcommand)]
pub enum ClientsCommands {
    /// List email clients
    List {
        /// Include inactive clients
        #[arg(long)]
        all: bool,

        /// Only clients carrying this tag
        #[arg(long)]
        tag: Option<String>,
    },

    /// Show client details
    Show {
        /// Client ID
        id: String,
    },

    /// Load the built-in client presets into the store
    Seed {
        /// Overwrite clients that already exist
        #[arg(long)]
        force: bool,
    },

    /// Make a client available for new jobs
    Activate {
        /// Client ID
        id: String,
    },

    /// Stop offering a client for new jobs
    Deactivate {
        /// Client ID
        id: String,
    },
}

/// Client row for listings
#[derive(Serialize)]
pub struct ClientDisplay {
    pub id: String,
    pub name: String,
    pub client_type: String,
    pub platform: String,
    pub engine: String,
    pub worker: String,
    pub compatibility: u8,
    pub priority: u8,
    pub market_share: Option<f64>,
    pub active: bool,
}

impl From<&EmailClient> for ClientDisplay {
    fn from(client: &EmailClient) -> Self {
        Self {
            id: client.id().to_string(),
            name: client.display_name().to_string(),
            client_type: client.client_type().to_string(),
            platform: client.platform().to_string(),
            engine: client.rendering_engine().to_string(),
            worker: client.worker_type().to_string(),
            compatibility: client.compatibility_score(),
            priority: client.test_config().priority,
            market_share: client.market_share(),
            active: client.is_active(),
        }
    }
}

impl TableDisplay for ClientDisplay {
    fn headers() -> Vec<&'static str> {
        vec![
            "ID", "Name", "Type", "Platform", "Engine", "Worker", "Compat", "Priority", "Share",
            "Active",
        ]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.client_type.clone(),
            self.platform.clone(),
            self.engine.clone(),
            self.worker.clone(),
            format!("{}%", self.compatibility),
            self.priority.to_string(),
            or_dash(self.market_share.map(|s| format!("{:.1}%", s))),
            if self.active { "yes" } else { "no" }.to_string(),
        ]
    }
}

pub fn execute(cmd: ClientsCommands, ctx: &Context) -> Result<()> {
    match cmd {
        ClientsCommands::List { all, tag } => {
            let clients: Vec<EmailClient> = ctx.db.list()?;
            let displays: Vec<ClientDisplay> = clients
                .iter()
                .filter(|c| all || c.is_active())
                .filter(|c| tag.as_deref().map_or(true, |t| c.has_tag(t)))
                .map(ClientDisplay::from)
                .collect();
            print_list(&displays, ctx.format)?;
        }

        ClientsCommands::Show { id } => {
            let client: EmailClient = ctx.db.load(&id)?;
            show(&client, ctx.format)?;
        }

        ClientsCommands::Seed { force } => {
            let mut seeded = 0;
            for client in presets::all()? {
                if force || !ctx.db.exists::<EmailClient>(client.id())? {
                    ctx.db.save(&client)?;
                    seeded += 1;
                }
            }
            print_success(
                &format!("Seeded {} of {} preset clients", seeded, presets::PRESET_IDS.len()),
                ctx.format,
            );
        }

        ClientsCommands::Activate { id } => {
            let mut client: EmailClient = ctx.db.load(&id)?;
            client.activate();
            ctx.db.save(&client)?;
            print_success(&format!("Client '{}' activated", id), ctx.format);
        }

        ClientsCommands::Deactivate { id } => {
            let mut client: EmailClient = ctx.db.load(&id)?;
            client.deactivate();
            ctx.db.save(&client)?;
            print_success(&format!("Client '{}' deactivated", id), ctx.format);
        }
    }

    Ok(())
}

fn show(client: &EmailClient, format: OutputFormat) -> Result<()> {
    if print_serialized(client, format)? {
        return Ok(());
    }
    print_item(&ClientDisplay::from(client), format)?;

    let config = client.test_config();
    let viewports: Vec<String> = config.viewports.iter().map(|v| v.to_string()).collect();
    print_details(&[
        ("Vendor", client.vendor().to_string()),
        ("Version", or_dash(client.version())),
        ("Automation", client.automation_config().target()),
        ("Viewports", viewports.join(", ")),
        ("Default viewport", client.default_viewport().to_string()),
        ("Dark mode tested", client.supports_dark_mode().to_string()),
        ("Timeout", format!("{} ms", config.timeout_ms)),
        ("Retries", config.retries.to_string()),
        (
            "Estimated test time",
            format!("{:.1} s", client.estimated_test_duration() as f64 / 1000.0),
        ),
        ("High priority", client.is_high_priority().to_string()),
        ("Tags", client.tags().join(", ")),
    ]);
    Ok(())
}
