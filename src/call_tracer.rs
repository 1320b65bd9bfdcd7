//! Call-frame tracing surface wired through the EVM host. The recording
//! tracer produces the call frames persisted alongside receipts; the noop
//! tracer is used when tracing is disabled.

use alloy_primitives::{Address, Bytes, U256};

use crate::evm::{CallKind, StatusCode};
use crate::primitives::Log;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallFrame {
    pub kind: CallKind,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub gas: u64,
    pub gas_used: u64,
    pub input: Bytes,
    pub output: Bytes,
    pub status: StatusCode,
    pub depth: u32,
    pub logs: Vec<Log>,
}

pub trait CallTracer: Send {
    fn on_enter(&mut self, kind: CallKind, from: Address, to: Option<Address>, value: U256, gas: u64, input: &Bytes, depth: u32);
    fn on_exit(&mut self, status: StatusCode, gas_used: u64, output: &Bytes);
    fn on_log(&mut self, log: &Log);
    fn on_self_destruct(&mut self, address: Address, beneficiary: Address, balance: U256);
    fn take_frames(&mut self) -> Vec<CallFrame>;
}

#[derive(Debug, Default)]
pub struct NoopCallTracer;

impl CallTracer for NoopCallTracer {
    fn on_enter(&mut self, _: CallKind, _: Address, _: Option<Address>, _: U256, _: u64, _: &Bytes, _: u32) {}

    fn on_exit(&mut self, _: StatusCode, _: u64, _: &Bytes) {}

    fn on_log(&mut self, _: &Log) {}

    fn on_self_destruct(&mut self, _: Address, _: Address, _: U256) {}

    fn take_frames(&mut self) -> Vec<CallFrame> {
        Vec::new()
    }
}

/// Records a flat list of completed frames in enter order.
#[derive(Debug, Default)]
pub struct RecordingCallTracer {
    open: Vec<usize>,
    frames: Vec<CallFrame>,
}

impl CallTracer for RecordingCallTracer {
    fn on_enter(&mut self, kind: CallKind, from: Address, to: Option<Address>, value: U256, gas: u64, input: &Bytes, depth: u32) {
        self.frames.push(CallFrame {
            kind,
            from,
            to,
            value,
            gas,
            input: input.clone(),
            depth,
            ..CallFrame::default()
        });
        self.open.push(self.frames.len() - 1);
    }

    fn on_exit(&mut self, status: StatusCode, gas_used: u64, output: &Bytes) {
        if let Some(idx) = self.open.pop() {
            let frame = &mut self.frames[idx];
            frame.status = status;
            frame.gas_used = gas_used;
            frame.output = output.clone();
        }
    }

    fn on_log(&mut self, log: &Log) {
        if let Some(idx) = self.open.last() {
            self.frames[*idx].logs.push(log.clone());
        }
    }

    fn on_self_destruct(&mut self, address: Address, beneficiary: Address, balance: U256) {
        let depth = self.open.len() as u32;
        self.frames.push(CallFrame {
            kind: CallKind::SelfDestruct,
            from: address,
            to: Some(beneficiary),
            value: balance,
            depth,
            ..CallFrame::default()
        });
    }

    fn take_frames(&mut self) -> Vec<CallFrame> {
        self.open.clear();
        std::mem::take(&mut self.frames)
    }
}
