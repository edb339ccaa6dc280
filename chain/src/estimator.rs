//! Gas estimation.
//!
//! A traced execution at the block gas limit gives a first estimate from the
//! per-frame gas requirements, accounting for the 63/64 forwarding rule.
//! The estimate is then verified, and tightened by bisection, against real
//! executions on throwaway copies of the state.

use simchain_common::gas::CALL_STIPEND;
use simchain_state::state_db::StateDb;
use simchain_state::transaction::Transaction;
use tracing::debug;

use crate::executor::{
    opcode, revert_reason, BlockContext, ExecutionStatus, Executor, HaltReason, Step,
    StepTracer, StructLogger,
};
use crate::ChainError;

/// Smallest gas `a` such that a call given `a` forwards at least `need`,
/// all but one 64th being forwarded.
pub fn all_but_one_64th_inverse(need: u64) -> u64 {
    let mut gas = need.saturating_mul(64) / 63;
    while gas - gas / 64 < need {
        gas += 1;
    }
    while gas > 0 && (gas - 1) - (gas - 1) / 64 >= need {
        gas -= 1;
    }
    gas
}

/// A call issued by a frame whose child frame is still running.
#[derive(Debug, Clone, Copy)]
struct PendingCall {
    cost: u64,
    stipend: u64,
}

#[derive(Debug)]
struct Frame {
    depth: u64,
    /// Gas the frame must start with to run to completion.
    need: u64,
    /// Gas the frame actually spent, children included.
    consumed: u64,
    call: Option<PendingCall>,
}

impl Frame {
    const fn new(depth: u64) -> Self {
        Self {
            depth,
            need: 0,
            consumed: 0,
            call: None,
        }
    }

    fn charge(&mut self, cost: u64) {
        self.need = self.need.max(self.consumed + cost);
        self.consumed += cost;
    }

    /// Settles a call that never entered a child frame.
    fn settle_shallow_call(&mut self) {
        if let Some(call) = self.call.take() {
            self.charge(call.cost);
        }
    }

    fn settle_child(&mut self, child: Frame) {
        let Some(call) = self.call.take() else {
            self.need = self.need.max(self.consumed + child.need);
            self.consumed += child.consumed;
            return;
        };
        let forwarded = all_but_one_64th_inverse(child.need.saturating_sub(call.stipend));
        self.need = self.need.max(self.consumed + call.cost + forwarded);
        self.consumed += (call.cost + child.consumed).saturating_sub(call.stipend);
    }
}

fn opens_frame(step: &Step) -> Option<PendingCall> {
    if !opcode::is_call(step.op) {
        return None;
    }
    // CALL and CALLCODE take the value third from the top.
    let sends_value = matches!(step.op, opcode::CALL | opcode::CALLCODE)
        && step
            .stack
            .len()
            .checked_sub(3)
            .and_then(|index| step.stack.get(index))
            .is_some_and(|value| !value.is_zero());
    Some(PendingCall {
        cost: step.gas_cost,
        stipend: if sends_value { CALL_STIPEND } else { 0 },
    })
}

fn close_frame(frames: &mut Vec<Frame>) {
    if frames.len() < 2 {
        return;
    }
    if let Some(mut child) = frames.pop() {
        child.settle_shallow_call();
        if let Some(parent) = frames.last_mut() {
            parent.settle_child(child);
        }
    }
}

/// Gas the outermost frame of a trace needs, intrinsic gas excluded.
pub fn root_frame_need(steps: &[Step]) -> u64 {
    let mut frames = vec![Frame::new(steps.first().map_or(1, |step| step.depth))];
    for step in steps {
        let top = frames.len() - 1;
        if step.depth > frames[top].depth {
            frames.push(Frame::new(step.depth));
        } else {
            frames[top].settle_shallow_call();
            while frames.len() > 1 && step.depth < frames[frames.len() - 1].depth {
                close_frame(&mut frames);
            }
        }

        let top = frames.len() - 1;
        match opens_frame(step) {
            Some(call) => frames[top].call = Some(call),
            None => frames[top].charge(step.gas_cost),
        }
    }
    while frames.len() > 1 {
        close_frame(&mut frames);
    }
    frames
        .pop()
        .map(|mut root| {
            root.settle_shallow_call();
            root.need
        })
        .unwrap_or_default()
}

/// Finds the smallest gas limit `tx` succeeds with in `block`, starting
/// from `state`, which is left untouched.
pub async fn estimate_gas(
    executor: &dyn Executor,
    tx: &Transaction,
    block: &BlockContext,
    state: &StateDb,
) -> Result<u64, ChainError> {
    let cap = block.gas_limit;
    let intrinsic = tx.intrinsic_gas();
    if intrinsic > cap {
        return Err(ChainError::EstimationFailed);
    }

    let mut logger = StructLogger::default();
    let mut exact = tx.clone();
    exact.gas_limit = cap;
    let result = executor
        .execute(
            &exact,
            block,
            &mut state.copy(),
            Some(&mut logger as &mut dyn StepTracer),
        )
        .await?;
    match result.status {
        ExecutionStatus::Success => {}
        ExecutionStatus::Revert => {
            return Err(ChainError::CallError {
                reason: revert_reason(&result.return_data),
                data: result.return_data,
            })
        }
        ExecutionStatus::Halt(HaltReason::OutOfGas) => return Err(ChainError::EstimationFailed),
        ExecutionStatus::Halt(reason) => {
            return Err(ChainError::CallError {
                reason: reason.to_string(),
                data: Vec::new(),
            })
        }
    }

    let estimate = intrinsic + root_frame_need(&logger.steps) + result.gas_refund;
    debug!(intrinsic, estimate, steps = logger.steps.len(), "traced gas estimate");

    let probe = move |gas_limit: u64| {
        let mut probe = tx.clone();
        probe.gas_limit = gas_limit;
        let mut scratch = state.copy();
        async move {
            executor
                .execute(&probe, block, &mut scratch, None)
                .await
                .map(|result| result.is_success())
        }
    };

    let mut hi = estimate.clamp(intrinsic, cap);
    let mut failing = None;
    while !probe(hi).await? {
        if hi >= cap {
            return Err(ChainError::EstimationFailed);
        }
        failing = Some(hi);
        hi = (hi.saturating_mul(64) / 63).max(hi + 1).min(cap);
    }

    let mut lo = match failing {
        Some(lo) => lo,
        None => {
            if hi == intrinsic || !probe(hi - 1).await? {
                return Ok(hi);
            }
            intrinsic - 1
        }
    };
    while lo + 1 < hi {
        let mid = lo + (hi - lo) / 2;
        if probe(mid).await? {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    debug!(gas = hi, "verified gas estimate");
    Ok(hi)
}

#[cfg(test)]
mod tests {
    use ethereum_types::{Address, U256};

    use super::*;

    fn step(depth: u64, op: u8, gas_cost: u64, stack: &[u64]) -> Step {
        Step {
            pc: 0,
            op,
            depth,
            gas: 0,
            gas_cost,
            stack: stack.iter().map(|&word| U256::from(word)).collect(),
            address: Address::zero(),
        }
    }

    #[test]
    fn inverse_is_the_smallest_sufficient_allowance() {
        assert_eq!(all_but_one_64th_inverse(0), 0);
        assert_eq!(all_but_one_64th_inverse(20_003), 20_320);
        for need in [1, 63, 64, 2_300, 100_000, 1_234_567] {
            let gas = all_but_one_64th_inverse(need);
            assert!(gas - gas / 64 >= need);
            assert!((gas - 1) - (gas - 1) / 64 < need);
        }
    }

    #[test]
    fn flat_trace_needs_its_peak() {
        let steps = [
            step(1, opcode::PUSH1, 3, &[]),
            step(1, opcode::SSTORE, 20_000, &[1, 1]),
            step(1, opcode::STOP, 0, &[]),
        ];
        assert_eq!(root_frame_need(&steps), 20_003);
    }

    #[test]
    fn nested_call_reserves_one_64th() {
        let steps = [
            step(1, opcode::PUSH1, 3, &[]),
            step(1, opcode::CALL, 100, &[0, 0, 0, 0, 0, 0xca11, 50_000]),
            step(2, opcode::PUSH1, 3, &[]),
            step(2, opcode::SSTORE, 20_000, &[1, 1]),
            step(2, opcode::STOP, 0, &[]),
            step(1, opcode::POP, 2, &[1]),
            step(1, opcode::STOP, 0, &[]),
        ];
        assert_eq!(root_frame_need(&steps), 3 + 100 + 20_320);
    }

    #[test]
    fn value_call_stipend_is_not_forwarded() {
        let steps = [
            step(1, opcode::CALL, 9_100, &[0, 0, 0, 0, 1, 0xca11, 50_000]),
            step(2, opcode::PUSH1, 3, &[]),
            step(2, opcode::LOG0, 375, &[0, 0]),
            step(2, opcode::STOP, 0, &[]),
        ];
        // The child needs 378, all of it covered by the stipend.
        assert_eq!(root_frame_need(&steps), 9_100);
    }

    #[test]
    fn call_without_code_is_a_plain_step() {
        let steps = [
            step(1, opcode::CALL, 100, &[0, 0, 0, 0, 0, 0xdead, 50_000]),
            step(1, opcode::POP, 2, &[1]),
        ];
        assert_eq!(root_frame_need(&steps), 102);
    }

    #[test]
    fn frames_returning_two_levels_at_once() {
        let steps = [
            step(1, opcode::CALL, 100, &[0, 0, 0, 0, 0, 0xa, 90_000]),
            step(2, opcode::CALL, 100, &[0, 0, 0, 0, 0, 0xb, 90_000]),
            step(3, opcode::SSTORE, 20_000, &[1, 1]),
            step(1, opcode::STOP, 0, &[]),
        ];
        let inner = 100 + all_but_one_64th_inverse(20_000);
        assert_eq!(root_frame_need(&steps), 100 + all_but_one_64th_inverse(inner));
    }
}
