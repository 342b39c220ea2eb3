//! PersonaDB CLI
//!
//! Thin wrapper around personadb-core functions for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show store information
//! personadb info
//!
//! # Create a persona from the coordinates of its EC public key
//! personadb persona create <x> <y> --nickname alice
//!
//! # Create a profile and link it to a persona
//! personadb profile create twitter.com alice
//! personadb link attach twitter.com alice <persona_id> --state confirmed
//!
//! # Find the persona that owns a profile
//! personadb link owner twitter.com alice
//!
//! # Check the link invariant, and repair it
//! personadb check
//! personadb check --fix
//!
//! # Send a raw request to the service
//! personadb request '{"method":"query_personas"}'
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use personadb_core::storage::SCHEMA_VERSION;
use personadb_core::{
    CheckMode, ConnectionConfirmState, DeleteConfirmation, JsonWebKey, LinkedProfileDetails,
    LinkedProfilesMerge, MergePolicy, Patch, PersonaDbConfig, PersonaIdentifier, PersonaRecord,
    PersonaRecordUpdate, PersonaService, ProfileIdentifier, ProfileRecord, ProfileRecordUpdate,
    UndefinedFieldPolicy,
};
use tracing::debug;

/// PersonaDB - personas, profiles and the links between them
#[derive(Parser)]
#[command(name = "personadb")]
#[command(version = "0.1.0")]
#[command(about = "PersonaDB - personas, profiles and the links between them")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.personadb)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON config file; overrides --data-dir
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Fail writes on link violations instead of repairing them
    #[arg(long, global = true)]
    no_auto_fix: bool,

    /// Print records as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store information
    Info,

    /// Persona management
    Persona {
        #[command(subcommand)]
        action: PersonaAction,
    },

    /// Profile management
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Profile ↔ persona links
    Link {
        #[command(subcommand)]
        action: LinkAction,
    },

    /// Check the link invariant
    Check {
        /// Repair violations instead of listing them
        #[arg(long)]
        fix: bool,
    },

    /// Rebuild the secondary indexes
    Reindex,

    /// Run one JSON request through the service and print the JSON response
    Request {
        /// Request body, e.g. '{"method":"query_personas"}'
        body: String,
    },
}

#[derive(Subcommand)]
enum PersonaAction {
    /// Create a persona from its public key coordinates
    Create {
        /// X coordinate (base64url)
        x: String,
        /// Y coordinate (base64url)
        y: String,
        /// Curve name
        #[arg(long, default_value = "K-256")]
        curve: String,
        /// Private scalar (base64url); marks the persona as owned
        #[arg(long)]
        private_key: Option<String>,
        #[arg(short, long)]
        nickname: Option<String>,
    },
    /// List personas
    List {
        /// Only personas with a private key
        #[arg(long)]
        owned: bool,
    },
    /// Show one persona
    Show {
        /// Persona ID (ec_key:...)
        persona_id: String,
    },
    /// Set or clear a persona's nickname
    Nickname {
        persona_id: String,
        /// New nickname; omit to clear
        nickname: Option<String>,
    },
    /// Delete a persona
    Delete {
        persona_id: String,
        /// Delete even if the persona holds a private key
        #[arg(long, conflicts_with = "safe")]
        force: bool,
        /// Only delete if the persona has no links and no private key
        #[arg(long)]
        safe: bool,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Create a profile
    Create {
        network: String,
        user_id: String,
        #[arg(short, long)]
        nickname: Option<String>,
    },
    /// List profiles
    List {
        /// Only profiles on this network
        #[arg(long)]
        network: Option<String>,
    },
    /// Show one profile
    Show { network: String, user_id: String },
    /// Set or clear a profile's nickname
    Nickname {
        network: String,
        user_id: String,
        /// New nickname; omit to clear
        nickname: Option<String>,
    },
    /// Delete a profile
    Delete { network: String, user_id: String },
}

#[derive(Subcommand)]
enum LinkAction {
    /// Link a profile to a persona, creating the profile if needed
    Attach {
        network: String,
        user_id: String,
        persona_id: String,
        /// Confirmation state: confirmed, pending, or denied
        #[arg(long, default_value = "pending")]
        state: String,
    },
    /// Remove a profile's link
    Detach { network: String, user_id: String },
    /// Show the persona a profile is linked to
    Owner { network: String, user_id: String },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.personadb)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".personadb")
}

fn load_config(cli: &Cli) -> Result<PersonaDbConfig> {
    let config = match &cli.config {
        Some(path) => PersonaDbConfig::from_json_file(path)
            .map_err(|e| anyhow::anyhow!("Invalid config '{}': {}", path.display(), e))?,
        None => PersonaDbConfig::in_dir(cli.data_dir.clone().unwrap_or_else(default_data_dir)),
    };
    Ok(if cli.no_auto_fix {
        config.with_auto_fix(false)
    } else {
        config
    })
}

/// Parse a persona ID from its text form
fn parse_persona_id(s: &str) -> Result<PersonaIdentifier> {
    s.parse::<PersonaIdentifier>()
        .map_err(|e| anyhow::anyhow!("Invalid persona ID '{}': {}", s, e))
}

fn parse_profile_id(network: &str, user_id: &str) -> Result<ProfileIdentifier> {
    ProfileIdentifier::new(network, user_id)
        .map_err(|e| anyhow::anyhow!("Invalid profile '{}/{}': {}", network, user_id, e))
}

/// Parse a link confirmation state from string
fn parse_confirm_state(s: &str) -> Result<ConnectionConfirmState> {
    match s.to_lowercase().as_str() {
        "confirmed" => Ok(ConnectionConfirmState::Confirmed),
        "pending" => Ok(ConnectionConfirmState::Pending),
        "denied" => Ok(ConnectionConfirmState::Denied),
        _ => anyhow::bail!(
            "Invalid state '{}'. Must be one of: confirmed, pending, denied",
            s
        ),
    }
}

fn state_label(state: ConnectionConfirmState) -> &'static str {
    match state {
        ConnectionConfirmState::Confirmed => "confirmed",
        ConnectionConfirmState::Pending => "pending",
        ConnectionConfirmState::Denied => "denied",
    }
}

fn print_persona(persona: &PersonaRecord) {
    println!("Persona: {}", persona.nickname.as_deref().unwrap_or("(no nickname)"));
    println!("  ID: {}", persona.identifier);
    println!("  Owned: {}", if persona.has_private_key() { "Yes" } else { "No" });
    println!("  Created: {}", persona.created_at.to_rfc3339());
    if persona.linked_profiles.is_empty() {
        println!("  Profiles: none");
    } else {
        println!("  Profiles ({}):", persona.linked_profiles.len());
        for (profile, details) in persona.linked_profiles.iter() {
            println!(
                "    {} [{}]",
                profile,
                state_label(details.connection_confirm_state)
            );
        }
    }
}

fn print_profile(profile: &ProfileRecord) {
    println!("Profile: {}", profile.identifier);
    if let Some(nickname) = &profile.nickname {
        println!("  Nickname: {}", nickname);
    }
    match &profile.linked_persona {
        Some(persona) => println!("  Linked to: {}", persona),
        None => println!("  Linked to: (none)"),
    }
    println!("  Updated: {}", profile.updated_at.to_rfc3339());
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_config(&cli)?;
    let service = PersonaService::open(&config)?;
    service
        .bus()
        .on_any(|event| debug!(event = %event.name(), "Store event"));

    match cli.command {
        Commands::Info => {
            let personas = service.query_personas(|_| true).await?;
            let owned = personas.iter().filter(|p| p.has_private_key()).count();
            let profiles = service.query_profiles(|_| true).await?;
            let violations = service.diagnose().await?;

            println!("PersonaDB v0.1.0");
            println!();
            println!("Database: {}", service.store().path().display());
            println!("Schema version: {}", SCHEMA_VERSION);
            println!("Auto-fix: {}", if config.auto_fix { "on" } else { "off" });
            println!();
            println!("Personas: {} ({} owned)", personas.len(), owned);
            println!("Profiles: {}", profiles.len());
            println!("Link violations: {}", violations.len());
        }

        Commands::Persona { action } => match action {
            PersonaAction::Create {
                x,
                y,
                curve,
                private_key,
                nickname,
            } => {
                let public_key = JsonWebKey::ec_public(curve, x, y);
                let id = PersonaIdentifier::from_public_key(&public_key)
                    .map_err(|e| anyhow::anyhow!("Invalid public key: {}", e))?;
                let mut record = PersonaRecord::new(id.clone(), public_key.clone());
                if let Some(d) = private_key {
                    record = record.with_private_key(public_key.with_private_scalar(d));
                }
                if let Some(nickname) = nickname {
                    record = record.with_nickname(nickname);
                }
                service.create_persona(record).await?;
                println!("Created persona");
                println!("  ID: {}", id);
            }

            PersonaAction::List { owned } => {
                let personas = if owned {
                    service.query_personas_with_private_key().await?
                } else {
                    service.query_personas(|_| true).await?
                };
                if cli.json {
                    print_json(&personas)?;
                } else if personas.is_empty() {
                    println!("No personas found.");
                } else {
                    println!("Personas ({}):", personas.len());
                    println!();
                    for persona in personas {
                        let owned = if persona.has_private_key() { " [owned]" } else { "" };
                        println!(
                            "  {} {}{} ({} profiles)",
                            persona.identifier,
                            persona.nickname.as_deref().unwrap_or("-"),
                            owned,
                            persona.linked_profiles.len()
                        );
                    }
                }
            }

            PersonaAction::Show { persona_id } => {
                let id = parse_persona_id(&persona_id)?;
                match service.query_persona(&id).await? {
                    Some(persona) if cli.json => print_json(&persona)?,
                    Some(persona) => print_persona(&persona),
                    None => anyhow::bail!("Persona not found: {}", id),
                }
            }

            PersonaAction::Nickname {
                persona_id,
                nickname,
            } => {
                let id = parse_persona_id(&persona_id)?;
                let mut update = PersonaRecordUpdate::new(id);
                update.nickname = match nickname {
                    Some(nickname) => Patch::Set(nickname),
                    None => Patch::Unset,
                };
                let policy = MergePolicy {
                    linked_profiles: LinkedProfilesMerge::Merge,
                    explicit_undefined_field: UndefinedFieldPolicy::DeleteField,
                };
                let persona = service.update_persona(update, policy).await?;
                match persona.nickname {
                    Some(nickname) => println!("Nickname set: {}", nickname),
                    None => println!("Nickname cleared."),
                }
            }

            PersonaAction::Delete {
                persona_id,
                force,
                safe,
            } => {
                let id = parse_persona_id(&persona_id)?;
                if safe {
                    if service.safe_delete_persona(&id).await? {
                        println!("Deleted persona {}", id);
                    } else {
                        println!("Kept persona {} (it has linked profiles or a private key)", id);
                    }
                } else {
                    let confirmation = if force {
                        DeleteConfirmation::DeleteEvenWithPrivate
                    } else {
                        DeleteConfirmation::DontDeleteIfHasPrivateKey
                    };
                    service.delete_persona(&id, confirmation).await?;
                    println!("Deleted persona {}", id);
                }
            }
        },

        Commands::Profile { action } => match action {
            ProfileAction::Create {
                network,
                user_id,
                nickname,
            } => {
                let id = parse_profile_id(&network, &user_id)?;
                let mut record = ProfileRecord::new(id.clone());
                if let Some(nickname) = nickname {
                    record = record.with_nickname(nickname);
                }
                service.create_profile(record).await?;
                println!("Created profile");
                println!("  ID: {}", id);
            }

            ProfileAction::List { network } => {
                let profiles = match &network {
                    Some(network) => service.query_profiles_by_network(network).await?,
                    None => service.query_profiles(|_| true).await?,
                };
                if cli.json {
                    print_json(&profiles)?;
                } else if profiles.is_empty() {
                    println!("No profiles found.");
                } else {
                    println!("Profiles ({}):", profiles.len());
                    println!();
                    for profile in profiles {
                        let linked = if profile.linked_persona.is_some() { " [linked]" } else { "" };
                        println!(
                            "  {} {}{}",
                            profile.identifier,
                            profile.nickname.as_deref().unwrap_or("-"),
                            linked
                        );
                    }
                }
            }

            ProfileAction::Show { network, user_id } => {
                let id = parse_profile_id(&network, &user_id)?;
                match service.query_profile(&id).await? {
                    Some(profile) if cli.json => print_json(&profile)?,
                    Some(profile) => print_profile(&profile),
                    None => anyhow::bail!("Profile not found: {}", id),
                }
            }

            ProfileAction::Nickname {
                network,
                user_id,
                nickname,
            } => {
                let id = parse_profile_id(&network, &user_id)?;
                let mut update = ProfileRecordUpdate::new(id);
                update.nickname = match nickname {
                    Some(nickname) => Patch::Set(nickname),
                    None => Patch::Unset,
                };
                let profile = service.update_profile(update).await?;
                match profile.nickname {
                    Some(nickname) => println!("Nickname set: {}", nickname),
                    None => println!("Nickname cleared."),
                }
            }

            ProfileAction::Delete { network, user_id } => {
                let id = parse_profile_id(&network, &user_id)?;
                match service.delete_profile(&id).await? {
                    Some(_) => println!("Deleted profile {}", id),
                    None => println!("No such profile: {}", id),
                }
            }
        },

        Commands::Link { action } => match action {
            LinkAction::Attach {
                network,
                user_id,
                persona_id,
                state,
            } => {
                let profile = parse_profile_id(&network, &user_id)?;
                let persona = parse_persona_id(&persona_id)?;
                let details = LinkedProfileDetails::new(parse_confirm_state(&state)?);
                if service.query_persona(&persona).await?.is_none() {
                    anyhow::bail!("Persona not found: {}", persona);
                }
                service.attach_profile(&profile, &persona, details).await?;
                println!("Attached {} to {}", profile, persona);
            }

            LinkAction::Detach { network, user_id } => {
                let profile = parse_profile_id(&network, &user_id)?;
                service.detach_profile(&profile).await?;
                println!("Detached {}", profile);
            }

            LinkAction::Owner { network, user_id } => {
                let profile = parse_profile_id(&network, &user_id)?;
                match service.query_persona_by_profile(&profile).await? {
                    Some(persona) if cli.json => print_json(&persona)?,
                    Some(persona) => print_persona(&persona),
                    None => println!("{} is not linked to a persona.", profile),
                }
            }
        },

        Commands::Check { fix } => {
            if fix {
                let report = service.check_consistency(CheckMode::Fix).await?;
                if cli.json {
                    print_json(&report)?;
                } else if report.is_clean() {
                    println!("No violations found.");
                } else {
                    println!("Repaired {} violation(s):", report.len());
                    for diagnosis in &report.repaired {
                        println!("  {}", diagnosis);
                    }
                }
            } else {
                let violations = service.diagnose().await?;
                if cli.json {
                    print_json(&violations)?;
                } else if violations.is_empty() {
                    println!("No violations found.");
                } else {
                    println!("Found {} violation(s):", violations.len());
                    for diagnosis in &violations {
                        println!("  {}", diagnosis);
                    }
                    println!();
                    println!("To repair, run: personadb check --fix");
                }
            }
        }

        Commands::Reindex => {
            let entries = service.store().rebuild_indexes()?;
            println!("Rebuilt indexes ({} entries).", entries);
        }

        Commands::Request { body } => {
            println!("{}", service.handle_json(&body).await);
        }
    }

    let delivered = service.bus().dispatch_pending();
    debug!(delivered, "Delivered store events");

    Ok(())
}
