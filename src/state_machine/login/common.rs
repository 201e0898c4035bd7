//! This module defines common structures and enums for the iSCSI Login state
//! machine. It provides the context and state definitions for handling the
//! login process.

use std::{collections::HashMap, marker::PhantomData, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::{
        config::{Config, login_keys_operational, operational_ranges},
        enums::Digest,
    },
    client::client::ClientConnection,
    models::{
        common::HEADER_LEN,
        data_fromat::PduResponse,
        login::{common::Stage, response::LoginResponse},
    },
    state_machine::{
        common::{StateMachine, StateMachineCtx, Transition},
        login::{
            login_chap::{ChapA, ChapAnswer, ChapOpToFull, ChapSecurity},
            login_plain::PlainStart,
        },
    },
};

/// This structure represents the context for a Login command.
#[derive(Debug)]
pub struct LoginCtx<'a> {
    _lt: PhantomData<&'a ()>,

    /// The client connection.
    pub conn: Arc<ClientConnection>,
    /// The Initiator Session ID.
    pub isid: [u8; 6],
    /// The Connection ID.
    pub cid: u16,
    /// The Target Session Identifying Handle.
    pub tsih: u16,
    /// The Initiator Task Tag.
    pub itt: u32,
    /// A buffer for the BHS.
    pub buf: [u8; HEADER_LEN],

    /// The last received login response.
    pub last_response: Option<PduResponse<LoginResponse>>,

    /// Our own `(CHAP_I, CHAP_C)` pair, set once we send a mutual CHAP
    /// challenge to the target; cleared once the target's counter-response
    /// has been verified.
    pub mutual_challenge: Option<(u8, Vec<u8>)>,

    state: Option<LoginStates>,
}

impl<'a> LoginCtx<'a> {
    /// Creates a new `LoginCtx` for a login operation.
    pub fn new(conn: Arc<ClientConnection>, isid: [u8; 6], cid: u16, tsih: u16) -> Self {
        Self {
            conn,
            isid,
            cid,
            tsih,
            itt: 0,
            buf: [0u8; HEADER_LEN],
            last_response: None,
            mutual_challenge: None,
            state: None,
            _lt: PhantomData,
        }
    }

    /// Sets the login state to use plain authentication.
    pub fn set_plain_login(&mut self) {
        self.state = Some(LoginStates::PlainStart(PlainStart));
    }

    /// Sets the login state to use CHAP authentication.
    pub fn set_chap_login(&mut self) {
        self.state = Some(LoginStates::ChapSecurity(ChapSecurity));
    }

    /// Validates and returns the header of the last login response.
    pub fn validate_last_response_header(&self) -> Result<&LoginResponse> {
        match &self.last_response {
            Some(l) => match l.header_view() {
                Ok(last) => Ok(last),
                Err(e) => Err(e),
            },
            None => Err(anyhow!("no last response in ctx")),
        }
    }

    /// Validates and returns the last login response PDU.
    pub fn validate_last_response_pdu(&self) -> Result<&PduResponse<LoginResponse>> {
        match &self.last_response {
            Some(l) => Ok(l),
            None => Err(anyhow!("no last response in ctx")),
        }
    }
}

/// A type alias for the output of a login state machine step.
pub type LoginStepOut = Transition<LoginStates, Result<()>>;

/// Distinguishes login failures the engine layer must map onto a specific
/// `LocalError` variant (§7) from generic I/O-ish failures, which fall back
/// to a less specific mapping. Carried through the state machine as an
/// `anyhow::Error` source and recovered with `downcast_ref` at the engine
/// boundary.
#[derive(Debug, thiserror::Error)]
pub enum LoginFailure {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("negotiation key {key} could not be reconciled: {reason}")]
    UnsupportedParameter { key: String, reason: String },
}

/// Defines the possible states for a Login operation state machine.
#[derive(Debug)]
pub enum LoginStates {
    /// The initial state for plain authentication.
    PlainStart(PlainStart),
    /// The initial state for CHAP authentication.
    ChapSecurity(ChapSecurity),
    /// The state for sending the CHAP algorithm.
    ChapA(ChapA),
    /// The state for sending the CHAP answer.
    ChapAnswer(ChapAnswer),
    /// The state for transitioning from operational to full feature phase.
    ChapOpToFull(ChapOpToFull),
}

impl<'ctx> StateMachineCtx<LoginCtx<'ctx>, PduResponse<LoginResponse>>
    for LoginCtx<'ctx>
{
    async fn execute(
        &mut self,
        _cancel: &CancellationToken,
    ) -> Result<PduResponse<LoginResponse>> {
        debug!("Loop login");
        loop {
            let state = self.state.take().context("state must be set LoginCtx")?;
            let tr = match state {
                LoginStates::PlainStart(s) => s.step(self).await,
                LoginStates::ChapSecurity(s) => s.step(self).await,
                LoginStates::ChapA(s) => s.step(self).await,
                LoginStates::ChapAnswer(s) => s.step(self).await,
                LoginStates::ChapOpToFull(s) => s.step(self).await,
            };

            match tr {
                Transition::Next(next_state, _r) => {
                    self.state = Some(next_state);
                },
                Transition::Stay(Ok(_)) => {},
                Transition::Stay(Err(e)) => return Err(e),
                Transition::Done(r) => {
                    r?;
                    return self
                        .last_response
                        .take()
                        .ok_or_else(|| anyhow!("no last response in ctx"));
                },
            }
        }
    }
}

fn parse_login_text_map(data: &[u8]) -> Result<HashMap<String, Vec<String>>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for entry in data.split(|b| *b == 0) {
        if entry.is_empty() {
            continue;
        }
        let entry_str = std::str::from_utf8(entry)
            .context("login response contains invalid UTF-8 text")?;
        let (key, value) = entry_str.split_once('=').ok_or_else(|| {
            anyhow!("login response entry '{entry_str}' is missing '=' separator")
        })?;
        let value = value.trim().to_string();
        if value == "NotUnderstood" {
            warn!("{}={}", key.to_string(), value);
            continue;
        }

        map.entry(key.to_string())
            .or_default()
            .push(value.trim().to_string());
    }
    Ok(map)
}

/// The subset of operational keys (§4.D) the engine cares about once the
/// login completes, reconciled from the initiator's proposal and the
/// target's response rather than taken verbatim from either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NegotiatedOperational {
    pub max_connections: u16,
    pub initial_r2t: bool,
    pub immediate_data: bool,
    pub data_pdu_in_order: bool,
    pub data_sequence_in_order: bool,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    pub max_outstanding_r2t: u16,
    pub default_time2wait: u32,
    pub default_time2retain: u32,
    pub error_recovery_level: u8,
    pub header_digest: Digest,
    pub data_digest: Digest,
}

/// Boolean reconciliation rules (§4.D); numeric keys always use `min` and
/// digests use agreement-else-None, so those don't need a `Rule` variant.
enum Rule {
    And,
    Or,
}

fn unsupported(key: &str, reason: impl Into<String>) -> anyhow::Error {
    LoginFailure::UnsupportedParameter { key: key.to_string(), reason: reason.into() }.into()
}

fn single_value<'a>(
    map: &'a HashMap<String, Vec<String>>,
    key: &str,
) -> Result<&'a str> {
    map.get(key)
        .and_then(|v| v.first())
        .map(String::as_str)
        .ok_or_else(|| unsupported(key, "missing from login response"))
}

fn parse_yes_no(key: &str, raw: &str) -> Result<bool> {
    match raw {
        "Yes" => Ok(true),
        "No" => Ok(false),
        other => Err(unsupported(key, format!("'{other}' is not Yes/No"))),
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64> {
    raw.parse::<u64>()
        .map_err(|_| unsupported(key, format!("'{raw}' is not a number")))
}

fn reconcile_numeric(
    key: &str,
    proposal: &HashMap<String, Vec<String>>,
    response: &HashMap<String, Vec<String>>,
    range: &operational_ranges::Range,
) -> Result<u64> {
    let ours = parse_u64(key, single_value(proposal, key)?)?;
    let theirs = parse_u64(key, single_value(response, key)?)?;
    let negotiated = ours.min(theirs);
    range
        .check(negotiated, key)
        .map_err(|e| unsupported(key, e.to_string()))?;
    Ok(negotiated)
}

fn reconcile_bool(
    key: &str,
    rule: Rule,
    proposal: &HashMap<String, Vec<String>>,
    response: &HashMap<String, Vec<String>>,
) -> Result<bool> {
    let ours = parse_yes_no(key, single_value(proposal, key)?)?;
    let theirs = parse_yes_no(key, single_value(response, key)?)?;
    Ok(match rule {
        Rule::And => ours && theirs,
        Rule::Or => ours || theirs,
    })
}

fn reconcile_digest(
    key: &str,
    proposal: &HashMap<String, Vec<String>>,
    response: &HashMap<String, Vec<String>>,
) -> Result<Digest> {
    let ours = single_value(proposal, key)?;
    let theirs = single_value(response, key)?;
    if ours == theirs {
        match theirs {
            "None" => Ok(Digest::None),
            "CRC32C" => Ok(Digest::CRC32C),
            other => Err(unsupported(key, format!("unknown digest '{other}'"))),
        }
    } else {
        Ok(Digest::None)
    }
}

/// Applies the §4.D reconciliation table to the initiator's proposal and the
/// target's operational-negotiation response, returning the values actually
/// in effect for the session/connection. This is not an echo check: a
/// target is free to counter-propose smaller limits or weaker settings, and
/// the rule for each key (min, AND, OR, or digest agreement) decides what
/// survives.
pub(crate) fn reconcile_operational_negotiation(
    cfg: &Config,
    rsp: &PduResponse<LoginResponse>,
) -> Result<NegotiatedOperational> {
    let header = rsp.header_view()?;
    match header.flags.nsg() {
        Some(Stage::FullFeature) => {},
        other => bail!(
            "login response NSG={other:?} (expected {:?})",
            Stage::FullFeature
        ),
    }

    let data = rsp
        .data()
        .context("login response missing negotiation payload")?;
    if data.is_empty() {
        bail!("login response negotiation payload is empty");
    }

    let response = parse_login_text_map(data)?;
    let proposal_bytes = login_keys_operational(cfg);
    let proposal = parse_login_text_map(proposal_bytes.as_slice())?;

    use operational_ranges as r;

    let max_connections =
        reconcile_numeric("MaxConnections", &proposal, &response, &r::MAX_CONNECTIONS)?
            as u16;
    let max_burst_length =
        reconcile_numeric("MaxBurstLength", &proposal, &response, &r::MAX_BURST_LENGTH)?
            as u32;
    let first_burst_length = reconcile_numeric(
        "FirstBurstLength",
        &proposal,
        &response,
        &r::FIRST_BURST_LENGTH,
    )? as u32;
    let max_outstanding_r2t = reconcile_numeric(
        "MaxOutstandingR2T",
        &proposal,
        &response,
        &r::MAX_OUTSTANDING_R2T,
    )? as u16;
    let default_time2wait = reconcile_numeric(
        "DefaultTime2Wait",
        &proposal,
        &response,
        &r::DEFAULT_TIME2WAIT,
    )? as u32;
    let default_time2retain = reconcile_numeric(
        "DefaultTime2Retain",
        &proposal,
        &response,
        &r::DEFAULT_TIME2RETAIN,
    )? as u32;
    let error_recovery_level = reconcile_numeric(
        "ErrorRecoveryLevel",
        &proposal,
        &response,
        &r::ERROR_RECOVERY_LEVEL,
    )? as u8;

    // MaxRecvDataSegmentLength is declarative, not reconciled: each side
    // keeps its own receive limit and the response's value only bounds what
    // we may send. Still range-checked so a malformed reply is rejected.
    r::MAX_RECV_DATA_SEGMENT_LENGTH
        .check(
            parse_u64(
                "MaxRecvDataSegmentLength",
                single_value(&response, "MaxRecvDataSegmentLength")?,
            )?,
            "MaxRecvDataSegmentLength",
        )
        .map_err(|e| unsupported("MaxRecvDataSegmentLength", e.to_string()))?;

    let initial_r2t = reconcile_bool("InitialR2T", Rule::Or, &proposal, &response)?;
    let immediate_data =
        reconcile_bool("ImmediateData", Rule::And, &proposal, &response)?;
    let data_pdu_in_order =
        reconcile_bool("DataPDUInOrder", Rule::And, &proposal, &response)?;
    let data_sequence_in_order =
        reconcile_bool("DataSequenceInOrder", Rule::And, &proposal, &response)?;

    let header_digest = reconcile_digest("HeaderDigest", &proposal, &response)?;
    let data_digest = reconcile_digest("DataDigest", &proposal, &response)?;

    Ok(NegotiatedOperational {
        max_connections,
        initial_r2t,
        immediate_data,
        data_pdu_in_order,
        data_sequence_in_order,
        max_burst_length,
        first_burst_length,
        max_outstanding_r2t,
        default_time2wait,
        default_time2retain,
        error_recovery_level,
        header_digest,
        data_digest,
    })
}
