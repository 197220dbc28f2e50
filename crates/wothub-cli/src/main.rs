//! Hub administration from the command line.
//!
//! Connects with the token file from the credentials directory, or locates
//! the hub via DNS-SD when no server URL is given. Usage errors exit with
//! code 1; transport and request failures print a single line on stderr and
//! exit with code 2.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use wothub_provision::{
    GetRequestsArgs, PreApprovedClient, ProvisionDeviceClient, ProvisionManageClient,
};
use wothub_transport::{connect_with_discovery, connect_with_token_file, HubClient};

#[derive(Debug, Parser)]
#[command(name = "wothub-cli", about = "WotHub administration client", version)]
struct Cli {
    /// Hub connect URL; discovered via DNS-SD when omitted
    #[arg(long, global = true)]
    server: Option<String>,

    /// Client id to authenticate as
    #[arg(long, global = true, default_value = "admin")]
    login: String,

    /// Directory holding <clientID>.token and caCert.pem
    #[arg(long, global = true, default_value = "./certs")]
    creds: PathBuf,

    /// Request timeout in seconds
    #[arg(long, global = true, default_value_t = 10)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Pre-approve a device before its first contact
    Idppreapprove {
        /// Device account id
        device_id: String,
        /// Expected public key (PEM or base64)
        pub_key: String,
        /// Expected hardware address
        mac: Option<String>,
        /// Account type to create on approval: device or service
        #[arg(long, default_value = "device")]
        client_type: String,
    },
    /// Approve a pending or rejected provisioning request
    Idpapprove {
        /// Device account id
        device_id: String,
    },
    /// Reject a provisioning request
    Idpreject {
        /// Device account id
        device_id: String,
    },
    /// List provisioning requests; without filters everything is shown
    Idplist {
        /// Show pending requests
        #[arg(long)]
        pending: bool,
        /// Show approved requests
        #[arg(long)]
        approved: bool,
        /// Show rejected requests
        #[arg(long)]
        rejected: bool,
    },
    /// Submit a provisioning request on behalf of a device
    Idpsubmit {
        /// Device account id
        device_id: String,
        /// Device public key (PEM or base64)
        pub_key: String,
        /// Device hardware address
        mac: Option<String>,
        /// Account type to create on approval: device or service
        #[arg(long, default_value = "device")]
        client_type: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = usage_exit_code(&e);
            let _ = e.print();
            std::process::exit(code);
        }
    };
    if let Err(e) = run(cli).await {
        eprintln!("wothub-cli: {e:#}");
        std::process::exit(2);
    }
}

/// Usage errors exit 1; --help and --version are clean exits.
fn usage_exit_code(e: &clap::Error) -> i32 {
    if e.use_stderr() {
        1
    } else {
        0
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let timeout = Duration::from_secs(cli.timeout);
    let hub = connect(&cli, timeout).await?;
    debug!(client_id = %hub.client_id(), "connected");

    match &cli.command {
        Command::Idppreapprove { device_id, pub_key, mac, client_type } => {
            ProvisionManageClient::new(&hub)
                .pre_approve(vec![PreApprovedClient {
                    client_id: device_id.clone(),
                    client_type: client_type.clone(),
                    pub_key: pub_key.clone(),
                    mac: mac.clone().unwrap_or_default(),
                }])
                .await
                .context("pre-approve failed")?;
            println!("pre-approved '{device_id}'");
        }
        Command::Idpapprove { device_id } => {
            ProvisionManageClient::new(&hub)
                .approve(device_id)
                .await
                .context("approve failed")?;
            println!("approved '{device_id}'");
        }
        Command::Idpreject { device_id } => {
            ProvisionManageClient::new(&hub)
                .reject(device_id)
                .await
                .context("reject failed")?;
            println!("rejected '{device_id}'");
        }
        Command::Idplist { pending, approved, rejected } => {
            let args = if *pending || *approved || *rejected {
                GetRequestsArgs { pending: *pending, approved: *approved, rejected: *rejected }
            } else {
                GetRequestsArgs::all()
            };
            let requests = ProvisionManageClient::new(&hub)
                .get_requests(args)
                .await
                .context("listing failed")?;
            println!("{:<20} {:<10} {:<24} {:>9}", "CLIENT ID", "STATE", "RECEIVED", "RETRY SEC");
            for r in requests {
                let state = if r.pending {
                    "pending"
                } else if r.is_rejected() {
                    "rejected"
                } else {
                    "approved"
                };
                println!(
                    "{:<20} {:<10} {:<24} {:>9}",
                    r.client_id,
                    state,
                    format_mse(r.received_mse),
                    r.retry_sec
                );
            }
        }
        Command::Idpsubmit { device_id, pub_key, mac, client_type } => {
            let resp = ProvisionDeviceClient::new(&hub)
                .submit(device_id, client_type, pub_key, mac.as_deref().unwrap_or_default())
                .await
                .context("submit failed")?;
            if resp.status.is_approved() {
                println!("approved; token:\n{}", resp.token);
            } else if resp.status.is_rejected() {
                println!("rejected; retry in {} seconds", resp.status.retry_sec);
            } else {
                println!("pending approval; retry in {} seconds", resp.status.retry_sec);
            }
        }
    }

    hub.disconnect().await;
    Ok(())
}

async fn connect(cli: &Cli, timeout: Duration) -> anyhow::Result<HubClient> {
    let hub = match &cli.server {
        Some(url) => connect_with_token_file(&cli.login, url, &cli.creds, timeout)
            .await
            .with_context(|| format!("connecting to {url}"))?,
        None => connect_with_discovery(&cli.login, &cli.creds, timeout)
            .await
            .context("locating the hub via DNS-SD")?,
    };
    Ok(hub)
}

fn format_mse(mse: i64) -> String {
    if mse == 0 {
        return "-".to_string();
    }
    chrono::DateTime::from_timestamp_millis(mse)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| mse.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn usage_errors_exit_with_code_1() {
        let err = Cli::try_parse_from(["wothub-cli", "idpfrobnicate"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 1);

        let err = Cli::try_parse_from(["wothub-cli", "idpapprove"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 1);
    }

    #[test]
    fn help_and_version_exit_clean() {
        let err = Cli::try_parse_from(["wothub-cli", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
        assert_eq!(usage_exit_code(&err), 0);

        let err = Cli::try_parse_from(["wothub-cli", "--version"]).unwrap_err();
        assert_eq!(usage_exit_code(&err), 0);
    }

    #[test]
    fn list_filters_parse() {
        let cli = Cli::try_parse_from(["wothub-cli", "idplist", "--pending", "--rejected"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Idplist { pending: true, approved: false, rejected: true }
        ));
    }
}
