// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The administration CLI (§6): encodes one command frame, sends it to
//! `iscsid` over the control socket, decodes the response and exits with
//! the mirrored `error_code`. `add`/`remove`/`modify`/`list` instead talk
//! directly to the on-disk config store, since those are static-database
//! edits the daemon does not need to be running to serve (the daemon and
//! the CLI are both just collaborators of the same `ConfigStore`, per §6).

use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use iscsi_client_rs::{
    cfg::enums::Digest,
    daemon::protocol::{CommandHeader, FuncCode, RESPONSE_HEADER_LEN, ResponseHeader},
    daemon::router::encode_login_portal_payload,
    store::{ConfigStore, FileConfigStore, TargetConfigType, TargetRecord},
    values::{Auth, ConnectionConfig, DiscoveryRecord, Portal, SessionConfig, Target},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};

#[derive(Parser, Debug)]
#[command(name = "iscsictl")]
#[command(about = "iSCSI initiator administration CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Control socket `iscsid` is listening on.
    #[arg(long, default_value = "/var/run/iscsid.sock")]
    socket: String,

    /// Persisted target/discovery-portal database (store.rs shape).
    #[arg(long, default_value = "docker/targets.yaml")]
    store: String,

    #[arg(short = 'v', long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a target to the static configuration database.
    Add(TargetArgs),
    /// Remove a target from the static configuration database.
    Remove(TargetArgs),
    /// Update an existing target's configuration database entry.
    Modify(TargetArgs),
    /// List configured targets.
    List {
        /// Also query the daemon for which targets currently have a live
        /// session.
        #[arg(short = 'a', long)]
        all: bool,
    },
    /// Log in to a target over one connection.
    Login(TargetArgs),
    /// Log out of a target (or one of its connections).
    Logout(TargetArgs),
    /// Run `SendTargets=All` against a discovery portal.
    Discovery(TargetArgs),
}

#[derive(Args, Debug, Default)]
struct TargetArgs {
    #[arg(short = 't', long = "target")]
    target: Option<String>,

    /// `host[:port]`.
    #[arg(short = 'p', long = "portal")]
    portal: Option<String>,

    #[arg(short = 'f', long = "interface")]
    interface: Option<String>,

    #[arg(short = 'u', long = "user")]
    user: Option<String>,

    #[arg(short = 's', long = "secret")]
    secret: Option<String>,

    #[arg(short = 'q', long = "mutual-user")]
    mutual_user: Option<String>,

    #[arg(short = 'r', long = "mutual-secret")]
    mutual_secret: Option<String>,

    /// Whole session instead of a single connection (`logout`), or all
    /// known targets instead of one (`discovery` response formatting).
    #[arg(short = 'a', long)]
    all: bool,
}

impl TargetArgs {
    fn require_target(&self) -> Result<&str> {
        self.target
            .as_deref()
            .context("-t/--target is required for this command")
    }

    fn require_portal(&self) -> Result<Portal> {
        let raw = self.portal.as_deref().context("-p/--portal is required for this command")?;
        let (host, port) = split_host_port(raw);
        let mut builder = Portal::new(host).port(port);
        if let Some(iface) = &self.interface {
            builder = builder.host_interface(iface.clone());
        }
        builder.build()
    }

    /// Persisted form of `-p/--portal`, for `add`/`modify`'s static
    /// database entry; `None` when the flag wasn't given.
    fn portal_record(&self) -> Option<iscsi_client_rs::store::PortalRecord> {
        let raw = self.portal.as_deref()?;
        let (address, port) = split_host_port(raw);
        Some(iscsi_client_rs::store::PortalRecord {
            address,
            port,
            host_interface: self.interface.clone().unwrap_or_default(),
        })
    }

    /// `None` means "let the daemon fall back to the stored secret", the
    /// same convention `do_login`'s empty `length3` payload uses (§4.G).
    fn auth(&self) -> Result<Option<Auth>> {
        match (&self.user, &self.secret) {
            (None, None) => Ok(None),
            (Some(user), Some(secret)) => Ok(Some(Auth::Chap {
                target_name: user.clone(),
                target_secret: secret.clone(),
                initiator_name: self.mutual_user.clone(),
                initiator_secret: self.mutual_secret.clone(),
            })),
            _ => bail!("-u/--user and -s/--secret must be given together"),
        }
    }
}

fn split_host_port(raw: &str) -> (String, String) {
    if let Some(rest) = raw.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = format!("[{}]", &rest[..end]);
            let after = &rest[end + 1..];
            let port = after.strip_prefix(':').unwrap_or(crate_default_port());
            return (host, port.to_string());
        }
    }
    match raw.rfind(':') {
        Some(idx) if raw[idx + 1..].chars().all(|c| c.is_ascii_digit()) && !raw[idx + 1..].is_empty() => {
            (raw[..idx].to_string(), raw[idx + 1..].to_string())
        },
        _ => (raw.to_string(), crate_default_port().to_string()),
    }
}

fn crate_default_port() -> &'static str {
    iscsi_client_rs::values::DEFAULT_PORT
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("iscsictl: {e:#}");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<u8> {
    match cli.command {
        Command::Add(args) => cmd_add(&cli.store, args),
        Command::Remove(args) => cmd_remove(&cli.store, args),
        Command::Modify(args) => cmd_modify(&cli.store, args),
        Command::List { all } => cmd_list(&cli.store, &cli.socket, all).await,
        Command::Login(args) => cmd_login(&cli.socket, args).await,
        Command::Logout(args) => cmd_logout(&cli.socket, args).await,
        Command::Discovery(args) => cmd_discovery(&cli.socket, args).await,
    }
}

fn open_store(path: &str) -> Result<FileConfigStore> {
    FileConfigStore::open(path).with_context(|| format!("opening config store {path}"))
}

fn cmd_add(store_path: &str, args: TargetArgs) -> Result<u8> {
    let iqn = args.require_target()?;
    let store = open_store(store_path)?;
    let record = TargetRecord {
        max_connections: 1,
        error_recovery_level: 0,
        header_digest: Digest::None,
        data_digest: Digest::None,
        auth_method: if args.user.is_some() { "CHAP".to_string() } else { "None".to_string() },
        auto_login: true,
        config_type: TargetConfigType::Static,
        portals: args.portal_record().into_iter().collect(),
    };
    store.upsert_target(iqn, record).context("writing target record")?;
    if args.secret.is_some() {
        eprintln!(
            "note: CHAP secrets are not persisted by `add`; pass -u/-s again on `login`"
        );
    }
    println!("added {iqn}");
    Ok(0)
}

fn cmd_remove(store_path: &str, args: TargetArgs) -> Result<u8> {
    let iqn = args.require_target()?;
    let store = open_store(store_path)?;
    store.remove_target(iqn).context("removing target record")?;
    println!("removed {iqn}");
    Ok(0)
}

fn cmd_modify(store_path: &str, args: TargetArgs) -> Result<u8> {
    let iqn = args.require_target()?;
    let store = open_store(store_path)?;
    let mut record = store
        .target(iqn)
        .context("reading existing target record")?
        .with_context(|| format!("target {iqn} is not configured, use `add` first"))?;
    if args.user.is_some() {
        record.auth_method = "CHAP".to_string();
    }
    if let Some(portal) = args.portal_record() {
        if !record.portals.contains(&portal) {
            record.portals.push(portal);
        }
    }
    store.upsert_target(iqn, record).context("writing target record")?;
    println!("modified {iqn}");
    Ok(0)
}

async fn cmd_list(store_path: &str, socket: &str, all: bool) -> Result<u8> {
    let store = open_store(store_path)?;
    let targets = store.all_targets().context("reading target records")?;
    for (iqn, record) in &targets {
        let active = if all {
            match query_is_target_active(socket, iqn).await {
                Ok(active) => if active { " [active]" } else { "" },
                Err(_) => " [daemon unreachable]",
            }
        } else {
            ""
        };
        println!(
            "{iqn} config_type={:?} auth_method={} auto_login={}{active}",
            record.config_type, record.auth_method, record.auto_login
        );
    }
    Ok(0)
}

async fn query_is_target_active(socket: &str, iqn: &str) -> Result<bool> {
    let mut cmd = CommandHeader::new(FuncCode::IsTargetActive);
    let p1 = iqn.as_bytes().to_vec();
    cmd.length1.set(p1.len() as u32);
    let (resp, _) = send_command(socket, cmd, p1, Vec::new(), Vec::new()).await?;
    Ok(resp.field1.get() != 0)
}

/// `iscsictl login -t <iqn>` with no `-p/--portal` sends an empty `length2`
/// payload, which tells `do_login` to try every portal the config store
/// knows about for that target instead of one explicit portal (§4.G
/// func_code 1's "Target only" form).
async fn cmd_login(socket: &str, args: TargetArgs) -> Result<u8> {
    let iqn = args.require_target()?.to_string();
    let auth = args.auth()?;

    let mut cmd = CommandHeader::new(FuncCode::Login);
    let p1 = Target::new(iqn.clone()).encode();
    let p2 = match &args.portal {
        Some(_) => {
            let portal = args.require_portal()?;
            let sess_cfg = SessionConfig {
                error_recovery_level: 0,
                max_connections: 1,
                target_portal_group_tag: 1,
            };
            let conn_cfg = ConnectionConfig {
                header_digest: Digest::None,
                data_digest: Digest::None,
            };
            encode_login_portal_payload(&portal, sess_cfg, conn_cfg)
        },
        None => Vec::new(),
    };
    let p3 = auth.map(|a| a.encode()).unwrap_or_default();
    cmd.length1.set(p1.len() as u32);
    cmd.length2.set(p2.len() as u32);
    cmd.length3.set(p3.len() as u32);

    let (resp, _) = send_command(socket, cmd, p1, p2, p3).await?;
    if resp.error_code.get() != 0 {
        bail!("login failed: error_code={} status_code={}", resp.error_code.get(), resp.status_code.get());
    }
    println!("logged in to {iqn}, session_id={}", resp.field1.get());
    Ok(0)
}

async fn cmd_logout(socket: &str, args: TargetArgs) -> Result<u8> {
    let iqn = args.require_target()?.to_string();
    let mut cmd = CommandHeader::new(FuncCode::Logout);
    let p1 = iqn.as_bytes().to_vec();
    cmd.length1.set(p1.len() as u32);
    // field2 stays 0: always a whole-session logout when addressed by IQN,
    // since the CLI has no per-connection id to offer (§6's `-a` flag just
    // documents that this is the "all connections" behavior, not a knob).
    let (resp, _) = send_command(socket, cmd, p1, Vec::new(), Vec::new()).await?;
    if resp.error_code.get() != 0 {
        bail!("logout failed: error_code={} status_code={}", resp.error_code.get(), resp.status_code.get());
    }
    println!("logged out of {iqn}");
    Ok(0)
}

async fn cmd_discovery(socket: &str, args: TargetArgs) -> Result<u8> {
    let portal = args.require_portal()?;
    let auth = args.auth()?.unwrap_or(Auth::None);

    let mut cmd = CommandHeader::new(FuncCode::QueryPortalForTargets);
    let p1 = portal.encode();
    let p2 = auth.encode();
    cmd.length1.set(p1.len() as u32);
    cmd.length2.set(p2.len() as u32);

    let (resp, data) = send_command(socket, cmd, p1, p2, Vec::new()).await?;
    if resp.error_code.get() != 0 {
        bail!("discovery failed: error_code={} status_code={}", resp.error_code.get(), resp.status_code.get());
    }
    let record = DiscoveryRecord::decode(&data).context("decoding discovery response")?;
    for (iqn, groups) in &record.targets {
        for (tpgt, portals) in groups {
            for p in portals {
                println!("{p},{tpgt} {iqn}");
            }
        }
    }
    Ok(0)
}

/// Sends one command frame and returns the decoded response header plus any
/// trailing `data_length` payload.
async fn send_command(
    socket: &str,
    cmd: CommandHeader,
    p1: Vec<u8>,
    p2: Vec<u8>,
    p3: Vec<u8>,
) -> Result<(ResponseHeader, Vec<u8>)> {
    let mut stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("connecting to {socket}"))?;

    let mut buf = [0u8; 24];
    cmd.to_bytes(&mut buf)?;
    stream.write_all(&buf).await.context("writing command header")?;
    stream.write_all(&p1).await.context("writing length1 payload")?;
    stream.write_all(&p2).await.context("writing length2 payload")?;
    stream.write_all(&p3).await.context("writing length3 payload")?;

    let mut resp_buf = [0u8; RESPONSE_HEADER_LEN];
    stream.read_exact(&mut resp_buf).await.context("reading response header")?;
    let resp = ResponseHeader::from_bytes(&resp_buf)?;

    let mut data = vec![0u8; resp.data_length.get() as usize];
    if !data.is_empty() {
        stream.read_exact(&mut data).await.context("reading response payload")?;
    }
    Ok((resp, data))
}
