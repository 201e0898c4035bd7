use std::pin::Pin;

use anyhow::{Context, Result, anyhow};
use md5::{Digest, Md5};
use rand::Rng;

use crate::{
    cfg::config::{
        AuthConfig, login_keys_chap_response_mutual, login_keys_operational,
        login_keys_security,
    },
    models::{
        common::Builder,
        data_fromat::PDUWithData,
        login::{
            common::Stage,
            request::{LoginRequest, LoginRequestBuilder},
            response::LoginResponse,
        },
    },
    state_machine::{
        common::{StateMachine, Transition},
        login::common::{LoginCtx, LoginFailure, LoginStates, LoginStepOut},
    },
};

/* -------------------- helpers (CHAP) -------------------- */

/// CHAP_R = MD5( one-octet CHAP_ID || secret || challenge ), HEX uppercase with
/// prefix 0x
fn calc_chap_r_hex(id: u8, secret: &[u8], challenge: &[u8]) -> String {
    let mut h = Md5::new();
    h.update([id]);
    h.update(secret);
    h.update(challenge);
    let d = h.finalize();

    let mut s = String::with_capacity(2 + d.len() * 2);
    s.push_str("0x");
    for b in d {
        use core::fmt::Write;
        write!(&mut s, "{b:02X}").expect("WTF");
    }
    s
}

/// split CHAP_I/CHAP_C
fn parse_chap_challenge(txt_bytes: &[u8]) -> Result<(u8, Vec<u8>)> {
    let txt = String::from_utf8(txt_bytes.to_vec())?;
    let mut chap_i: Option<u8> = None;
    let mut chap_c_hex: Option<String> = None;

    for kv in txt.split_terminator('\x00') {
        let mut parts = kv.splitn(2, '=');
        match (parts.next(), parts.next()) {
            (Some("CHAP_I"), Some(v)) => chap_i = Some(v.trim().parse()?),
            (Some("CHAP_C"), Some(s)) => {
                let s = s.trim();
                let s = s
                    .strip_prefix("0x")
                    .or_else(|| s.strip_prefix("0X"))
                    .unwrap_or(s);
                chap_c_hex = Some(s.to_string());
            },
            _ => {},
        }
    }

    let id = chap_i.context("missing CHAP_I")?;
    let hex = chap_c_hex.context("missing CHAP_C")?;
    if hex.len() % 2 != 0 {
        anyhow::bail!("CHAP_C hex length must be even, got {}", hex.len());
    }
    let chal =
        hex::decode(&hex).with_context(|| format!("failed to decode CHAP_C: {hex}"))?;
    Ok((id, chal))
}

/// split CHAP_N/CHAP_R out of the target's mutual counter-response
fn parse_chap_reply(txt_bytes: &[u8]) -> Result<(String, String)> {
    let txt = String::from_utf8(txt_bytes.to_vec())?;
    let mut chap_n: Option<String> = None;
    let mut chap_r_hex: Option<String> = None;

    for kv in txt.split_terminator('\x00') {
        let mut parts = kv.splitn(2, '=');
        match (parts.next(), parts.next()) {
            (Some("CHAP_N"), Some(v)) => chap_n = Some(v.trim().to_string()),
            (Some("CHAP_R"), Some(v)) => {
                let v = v.trim();
                let v = v
                    .strip_prefix("0x")
                    .or_else(|| v.strip_prefix("0X"))
                    .unwrap_or(v);
                chap_r_hex = Some(v.to_string());
            },
            _ => {},
        }
    }

    Ok((
        chap_n.context("missing CHAP_N in mutual CHAP reply")?,
        chap_r_hex.context("missing CHAP_R in mutual CHAP reply")?,
    ))
}

/// draws our own `(CHAP_I, CHAP_C)` pair for a mutual CHAP challenge
fn gen_mutual_challenge() -> (u8, Vec<u8>, String) {
    let mut id_buf = [0u8; 1];
    rand::rng().fill(&mut id_buf);
    let mut chal = vec![0u8; 16];
    rand::rng().fill(chal.as_mut_slice());

    let mut hex = String::with_capacity(2 + chal.len() * 2);
    hex.push_str("0x");
    for b in &chal {
        use core::fmt::Write;
        write!(&mut hex, "{b:02x}").expect("WTF");
    }
    (id_buf[0], chal, hex)
}

/// Verifies the target's mutual CHAP counter-response against our own
/// challenge (§4.C, scenario 3). Consumes the current `last_response`'s data
/// segment.
fn verify_mutual_chap(ctx: &LoginCtx<'_>, our_id: u8, our_chal: &[u8]) -> Result<()> {
    let mutual_cfg = match &ctx.conn.cfg.login.auth {
        AuthConfig::Chap(c) => c.mutual.as_ref().ok_or_else(|| {
            anyhow!("mutual CHAP challenge pending but config has no mutual credentials")
        })?,
        AuthConfig::None => {
            return Err(anyhow!("mutual CHAP challenge pending but auth is None"));
        },
    };

    let rsp = ctx.validate_last_response_pdu()?;
    let data = rsp.data()?;
    let (peer_name, peer_chap_r_hex) = parse_chap_reply(data)?;

    if !peer_name.eq_ignore_ascii_case(&mutual_cfg.username) {
        return Err(LoginFailure::Auth(format!(
            "mutual CHAP: target replied CHAP_N={peer_name}, expected \
             {}",
            mutual_cfg.username
        ))
        .into());
    }

    let expected = calc_chap_r_hex(our_id, mutual_cfg.secret.as_bytes(), our_chal);
    let expected_hex = expected.trim_start_matches("0x");
    if !peer_chap_r_hex.eq_ignore_ascii_case(expected_hex) {
        return Err(LoginFailure::Auth(
            "mutual CHAP: target's CHAP_R did not match the expected response"
                .to_string(),
        )
        .into());
    }

    Ok(())
}

#[derive(Debug)]
pub struct ChapSecurity;

impl<'ctx> StateMachine<LoginCtx<'ctx>, LoginStepOut> for ChapSecurity {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = LoginStepOut> + Send + 'a>>
    where
        Self: 'a,
        LoginCtx<'ctx>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut LoginCtx<'ctx>) -> Self::StepResult<'a> {
        Box::pin(async move {
            // Step1: Security → Security (without CHAP_A)
            let header = LoginRequestBuilder::new(ctx.isid, ctx.tsih)
                .csg(Stage::Security)
                .nsg(Stage::Security)
                .initiator_task_tag(ctx.itt)
                .connection_id(ctx.cid)
                .cmd_sn(0)
                .exp_stat_sn(0);

            if let Err(e) = header.header.to_bhs_bytes(ctx.buf.as_mut_slice()) {
                return Transition::Done(Err(e));
            }

            let mut pdu =
                PDUWithData::<LoginRequest>::from_header_slice(ctx.buf, &ctx.conn.cfg);
            pdu.append_data(login_keys_security(&ctx.conn.cfg).as_slice());

            match ctx.conn.send_request(ctx.itt, pdu).await {
                Err(e) => Transition::Done(Err(e)),
                Ok(()) => match ctx.conn.read_response::<LoginResponse>(ctx.itt).await {
                    Ok(rsp) => {
                        ctx.last_response = Some(rsp);
                        Transition::Next(LoginStates::ChapA(ChapA), Ok(()))
                    },
                    Err(e) => Transition::Done(Err(e)),
                },
            }
        })
    }
}

#[derive(Debug)]
pub struct ChapA;

impl<'ctx> StateMachine<LoginCtx<'ctx>, LoginStepOut> for ChapA {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = LoginStepOut> + Send + 'a>>
    where
        Self: 'a,
        LoginCtx<'ctx>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut LoginCtx<'ctx>) -> Self::StepResult<'a> {
        Box::pin(async move {
            // Step2: Security → Security, CHAP_A=5
            let (header, itt) = {
                let last = match ctx.validate_last_response_header() {
                    Ok(last) => last,
                    Err(e) => {
                        return Transition::Done(Err(e));
                    },
                };

                let header = LoginRequestBuilder::new(ctx.isid, last.tsih.get())
                    .csg(Stage::Security)
                    .nsg(Stage::Security)
                    .initiator_task_tag(last.initiator_task_tag.get())
                    .connection_id(ctx.cid)
                    .cmd_sn(last.exp_cmd_sn.get())
                    .exp_stat_sn(last.stat_sn.get().wrapping_add(1));

                (header, last.initiator_task_tag.get())
            };

            if let Err(e) = header.header.to_bhs_bytes(ctx.buf.as_mut_slice()) {
                return Transition::Done(Err(e));
            }

            let mut pdu =
                PDUWithData::<LoginRequest>::from_header_slice(ctx.buf, &ctx.conn.cfg);
            pdu.append_data(b"CHAP_A=5\x00".as_slice());

            match ctx.conn.send_request(itt, pdu).await {
                Err(e) => Transition::Done(Err(e)),
                Ok(()) => match ctx.conn.read_response::<LoginResponse>(itt).await {
                    Ok(rsp) => {
                        ctx.last_response = Some(rsp);
                        Transition::Next(LoginStates::ChapAnswer(ChapAnswer), Ok(()))
                    },
                    Err(e) => Transition::Done(Err(e)),
                },
            }
        })
    }
}

#[derive(Debug)]
pub struct ChapAnswer;

impl<'ctx> StateMachine<LoginCtx<'ctx>, LoginStepOut> for ChapAnswer {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = LoginStepOut> + Send + 'a>>
    where
        Self: 'a,
        LoginCtx<'ctx>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut LoginCtx<'ctx>) -> Self::StepResult<'a> {
        Box::pin(async move {
            let (header, itt, user, chap_r, mutual) = {
                let last = match ctx.validate_last_response_pdu() {
                    Ok(last) => last,
                    Err(e) => return Transition::Done(Err(e)),
                };

                let last_header = match ctx.validate_last_response_header() {
                    Ok(last) => last,
                    Err(e) => return Transition::Done(Err(e)),
                };

                let data = match last.data() {
                    Ok(data) => data,
                    Err(e) => return Transition::Done(Err(e)),
                };

                let (id, chal) = match parse_chap_challenge(data) {
                    Ok(v) => v,
                    Err(e) => return Transition::Done(Err(e)),
                };

                let (user, secret, wants_mutual) = match &ctx.conn.cfg.login.auth {
                    AuthConfig::Chap(c) => {
                        (c.username.as_str(), c.secret.as_bytes(), c.mutual.is_some())
                    },
                    AuthConfig::None => {
                        return Transition::Done(Err(LoginFailure::Auth(
                            "target requires CHAP but config has no credentials"
                                .to_string(),
                        )
                        .into()));
                    },
                };

                let chap_r = calc_chap_r_hex(id, secret, &chal);

                let mutual = wants_mutual.then(gen_mutual_challenge);
                if let Some((mid, mchal, _)) = &mutual {
                    ctx.mutual_challenge = Some((*mid, mchal.clone()));
                }

                // Step3: (Security -> Operational, Transit=1)
                let header = LoginRequestBuilder::new(ctx.isid, last_header.tsih.get())
                    .transit()
                    .csg(Stage::Security)
                    .nsg(Stage::Operational)
                    .initiator_task_tag(last_header.initiator_task_tag.get())
                    .connection_id(ctx.cid)
                    .cmd_sn(last_header.exp_cmd_sn.get())
                    .exp_stat_sn(last_header.stat_sn.get().wrapping_add(1));

                (
                    header,
                    last_header.initiator_task_tag.get(),
                    user,
                    chap_r,
                    mutual,
                )
            };

            if let Err(e) = header.header.to_bhs_bytes(ctx.buf.as_mut_slice()) {
                return Transition::Done(Err(e));
            }

            let mut pdu =
                PDUWithData::<LoginRequest>::from_header_slice(ctx.buf, &ctx.conn.cfg);
            let mutual_for_wire = mutual.as_ref().map(|(id, _, hex)| (*id, hex.as_str()));
            pdu.append_data(
                login_keys_chap_response_mutual(user, &chap_r, mutual_for_wire).as_slice(),
            );

            if let Err(e) = ctx.conn.send_request(itt, pdu).await {
                return Transition::Done(Err(e));
            }

            match ctx.conn.read_response::<LoginResponse>(itt).await {
                Ok(rsp) => {
                    ctx.last_response = Some(rsp);
                    Transition::Next(LoginStates::ChapOpToFull(ChapOpToFull), Ok(()))
                },
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

#[derive(Debug)]
pub struct ChapOpToFull;

impl<'ctx> StateMachine<LoginCtx<'ctx>, LoginStepOut> for ChapOpToFull {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = LoginStepOut> + Send + 'a>>
    where
        Self: 'a,
        LoginCtx<'ctx>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut LoginCtx<'ctx>) -> Self::StepResult<'a> {
        Box::pin(async move {
            if let Some((our_id, our_chal)) = ctx.mutual_challenge.take() {
                if let Err(e) = verify_mutual_chap(ctx, our_id, &our_chal) {
                    return Transition::Done(Err(e));
                }
            }

            // Step4: Operational (Transit) → FullFeature + operational keys
            let (header, itt) = {
                let last = match ctx.validate_last_response_header() {
                    Ok(last) => last,
                    Err(e) => return Transition::Done(Err(e)),
                };

                let header = LoginRequestBuilder::new(ctx.isid, last.tsih.get())
                    .transit()
                    .csg(Stage::Operational)
                    .nsg(Stage::FullFeature)
                    .versions(last.version_max, last.version_active)
                    .initiator_task_tag(last.initiator_task_tag.get())
                    .connection_id(ctx.cid)
                    .cmd_sn(last.exp_cmd_sn.get())
                    .exp_stat_sn(last.stat_sn.get().wrapping_add(1));
                (header, last.initiator_task_tag.get())
            };

            if let Err(e) = header.header.to_bhs_bytes(ctx.buf.as_mut_slice()) {
                return Transition::Done(Err(e));
            }

            let mut pdu =
                PDUWithData::<LoginRequest>::from_header_slice(ctx.buf, &ctx.conn.cfg);
            pdu.append_data(login_keys_operational(&ctx.conn.cfg).as_slice());

            match ctx.conn.send_request(itt, pdu).await {
                Err(e) => Transition::Done(Err(e)),
                Ok(()) => match ctx.conn.read_response::<LoginResponse>(itt).await {
                    Ok(rsp) => {
                        ctx.last_response = Some(rsp);
                        Transition::Done(Ok(()))
                    },
                    Err(e) => Transition::Done(Err(e)),
                },
            }
        })
    }
}
