// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    marker::PhantomData,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    client::client::ClientConnection,
    models::{
        common::{Builder, HEADER_LEN, SendingData},
        data_fromat::{PduRequest, PduResponse},
        text::{
            request::{TextRequest, TextRequestBuilder},
            response::TextResponse,
        },
    },
    state_machine::common::{StateMachine, StateMachineCtx, Transition},
};

/// This structure represents the context for a Text Request/Response
/// exchange (RFC3720 §10.11). It drives one or more round trips until the
/// target clears the Continue bit, accumulating the key/value data segment
/// across every response in the exchange.
#[derive(Debug)]
pub struct TextCtx<'a> {
    _lt: PhantomData<&'a ()>,

    pub conn: Arc<ClientConnection>,
    pub itt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: Arc<AtomicU32>,
    pub buf: [u8; HEADER_LEN],

    initial_data: Vec<u8>,
    target_transfer_tag: u32,
    accumulated: Vec<u8>,

    last_response: Option<PduResponse<TextResponse>>,
    state: Option<TextStates>,
}

impl<'a> TextCtx<'a> {
    /// `data` is the key/value payload for the very first Text Request
    /// (e.g. `SendTargets=All\0`); continuation requests that follow a
    /// Continue=1 response carry no new keys.
    pub fn new(
        conn: Arc<ClientConnection>,
        itt: Arc<AtomicU32>,
        cmd_sn: Arc<AtomicU32>,
        exp_stat_sn: Arc<AtomicU32>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            conn,
            itt: itt.fetch_add(1, Ordering::SeqCst),
            cmd_sn: cmd_sn.load(Ordering::SeqCst),
            exp_stat_sn,
            buf: [0u8; HEADER_LEN],
            initial_data: data,
            target_transfer_tag: TextRequest::DEFAULT_TAG,
            accumulated: Vec::new(),
            last_response: None,
            state: Some(TextStates::Start(Start)),
            _lt: PhantomData,
        }
    }

    async fn send_text(&mut self, data: &[u8]) -> Result<()> {
        let exp_stat_sn = self.exp_stat_sn.load(Ordering::SeqCst);
        let header = TextRequestBuilder::new()
            .immediate()
            .initiator_task_tag(self.itt)
            .target_task_tag(self.target_transfer_tag)
            .cmd_sn(self.cmd_sn)
            .exp_stat_sn(exp_stat_sn)
            .lun(0);

        header.header.to_bhs_bytes(self.buf.as_mut_slice())?;

        let mut pdu = PduRequest::<TextRequest>::new_request(self.buf, &self.conn.cfg);
        pdu.append_data(data);
        self.conn.send_request(self.itt, pdu).await?;
        Ok(())
    }

    async fn receive_text(&mut self) -> Result<bool> {
        let rsp = self.conn.read_response::<TextResponse>(self.itt).await?;
        let hv = rsp.header_view()?;

        self.exp_stat_sn
            .store(hv.stat_sn.get().wrapping_add(1), Ordering::SeqCst);
        self.target_transfer_tag = hv.target_transfer_tag.get();
        let continuing = hv.get_continue_bit();

        self.accumulated.extend_from_slice(rsp.data()?);
        self.last_response = Some(rsp);
        Ok(continuing)
    }
}

/// Sends the initial (possibly only) Text Request of the exchange.
#[derive(Debug)]
pub struct Start;

/// Waits for a Text Response; loops back to a continuation request when the
/// target leaves its Continue bit set.
#[derive(Debug)]
pub struct Wait;

/// Sends an empty continuation Text Request requesting the remainder of a
/// response that spans more than one PDU.
#[derive(Debug)]
pub struct Continue;

/// Defines the possible states for a Text Request/Response exchange.
#[derive(Debug)]
pub enum TextStates {
    Start(Start),
    Wait(Wait),
    Continue(Continue),
}

type TextStepOut = Transition<TextStates, Result<()>>;

impl<'ctx> StateMachine<TextCtx<'ctx>, TextStepOut> for Start {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = TextStepOut> + Send + 'a>>
    where
        Self: 'a,
        TextCtx<'ctx>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut TextCtx<'ctx>) -> Self::StepResult<'a> {
        Box::pin(async move {
            let data = std::mem::take(&mut ctx.initial_data);
            match ctx.send_text(&data).await {
                Ok(()) => Transition::Next(TextStates::Wait(Wait), Ok(())),
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

impl<'ctx> StateMachine<TextCtx<'ctx>, TextStepOut> for Wait {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = TextStepOut> + Send + 'a>>
    where
        Self: 'a,
        TextCtx<'ctx>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut TextCtx<'ctx>) -> Self::StepResult<'a> {
        Box::pin(async move {
            match ctx.receive_text().await {
                Ok(true) => Transition::Next(TextStates::Continue(Continue), Ok(())),
                Ok(false) => Transition::Done(Ok(())),
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

impl<'ctx> StateMachine<TextCtx<'ctx>, TextStepOut> for Continue {
    type StepResult<'a>
        = Pin<Box<dyn Future<Output = TextStepOut> + Send + 'a>>
    where
        Self: 'a,
        TextCtx<'ctx>: 'a;

    fn step<'a>(&'a self, ctx: &'a mut TextCtx<'ctx>) -> Self::StepResult<'a> {
        Box::pin(async move {
            match ctx.send_text(&[]).await {
                Ok(()) => Transition::Next(TextStates::Wait(Wait), Ok(())),
                Err(e) => Transition::Done(Err(e)),
            }
        })
    }
}

/// The accumulated result of a (possibly multi-round) Text Request/Response
/// exchange: every response's data segment concatenated in order, plus the
/// final response header for sequence-number bookkeeping.
#[derive(Debug)]
pub struct TextExchange {
    pub last_response: PduResponse<TextResponse>,
    pub data: Vec<u8>,
}

impl<'s> StateMachineCtx<TextCtx<'s>, TextExchange> for TextCtx<'s> {
    async fn execute(&mut self, _cancel: &CancellationToken) -> Result<TextExchange> {
        debug!("Loop text");
        loop {
            let state = self.state.take().context("state must be set TextCtx")?;
            let trans = match state {
                TextStates::Start(s) => s.step(self).await,
                TextStates::Wait(s) => s.step(self).await,
                TextStates::Continue(s) => s.step(self).await,
            };

            match trans {
                Transition::Next(next, r) => {
                    r?;
                    self.state = Some(next);
                },
                Transition::Stay(Ok(_)) => {},
                Transition::Stay(Err(e)) => return Err(e),
                Transition::Done(r) => {
                    r?;
                    let last_response = self
                        .last_response
                        .take()
                        .ok_or_else(|| anyhow!("no last response in ctx"))?;
                    return Ok(TextExchange {
                        last_response,
                        data: std::mem::take(&mut self.accumulated),
                    });
                },
            }
        }
    }
}
