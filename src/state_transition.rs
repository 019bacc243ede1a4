//! Applying a single transaction to a world state.
//!
//! Every check that can reject the transaction runs before the state is touched, so a rejected
//! transaction leaves no trace. Once gas is bought the transaction always lands: a failing
//! contract only loses its effects and the gas it was given.
use std::sync::Arc;

use log::{debug, trace};

use crate::common::{create_addr, Addr, Bytes, Gas, Wei, U256};
use crate::core::params::{GAS_DATA, GAS_TX};
use crate::core::{
    apply_message, ExecError, PlainCode, Transferable, TxExecContext, TxExecEnv, TxExecResult,
    WorldState,
};
use crate::error::TxError;
use crate::tx::Tx;

/// Gas left in the block being processed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GasPool(Gas);

impl GasPool {
    pub fn new(limit: Gas) -> Self {
        Self(limit)
    }

    pub fn remaining(&self) -> Gas {
        self.0
    }

    pub fn sub(&mut self, gas: Gas) -> Result<(), TxError> {
        if self.0 < gas {
            return Err(TxError::BlockGasLimit {
                available: self.0,
                gas,
            })
        }
        self.0 -= gas;
        Ok(())
    }

    pub fn add(&mut self, gas: Gas) {
        self.0 = self.0.saturating_add(gas);
    }
}

/// One executed message, published on the `messages` topic for external indexers.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub block_number: u64,
    pub origin: Addr,
    pub from: Addr,
    /// the new contract for creations
    pub to: Addr,
    pub value: Wei,
    pub input: Bytes,
    pub output: Bytes,
    pub created: bool,
    pub failed: bool,
}

/// What a transaction that made it into the block did.
#[derive(Clone, Debug)]
pub struct Outcome {
    pub gas_used: Gas,
    /// returned to the sender, `gas_used + gas_refunded` is the transaction's gas
    pub gas_refunded: Gas,
    /// the fault that discarded the execution's effects, if any
    pub failed: Option<ExecError>,
    pub contract: Option<Addr>,
    pub output: Bytes,
    pub messages: Vec<Message>,
}

pub fn intrinsic_gas(data: &[u8]) -> Result<Gas, TxError> {
    (data.len() as Gas)
        .checked_mul(GAS_DATA)
        .and_then(|g| g.checked_add(GAS_TX))
        .ok_or(TxError::Overflow)
}

fn wei_mul(gas: Gas, price: &Wei) -> Result<Wei, TxError> {
    Wei::from(gas).checked_mul(price).ok_or(TxError::Overflow)
}

/// Apply `tx` to `state`. The block's coinbase is taken from `env`; `pool` is the gas left in
/// the block.
pub fn apply_transaction<S: WorldState>(
    state: &mut S, env: &TxExecEnv, pool: &mut GasPool, tx: &Tx,
) -> Result<Outcome, TxError> {
    let sender = tx.from().clone();
    let price = tx.gas_price().clone();

    env.protocol.validate_tx(tx, &*state)?;
    let nonce = state.get_nonce(&sender);
    if nonce != tx.nonce() {
        return Err(TxError::Nonce {
            expected: nonce,
            got: tx.nonce(),
        })
    }
    let intrinsic = intrinsic_gas(tx.data())?;
    if tx.gas() < intrinsic {
        return Err(TxError::IntrinsicGas {
            gas: tx.gas(),
            required: intrinsic,
        })
    }
    let cost = wei_mul(tx.gas(), &price)?;
    let need = cost.checked_add(tx.value()).ok_or(TxError::Overflow)?;
    let have = state.get_balance(&sender);
    if have < need {
        return Err(TxError::InsufficientBalance { have, need })
    }
    pool.sub(tx.gas())?;

    // buy gas
    state.sub_balance(&sender, &cost).ok_or(TxError::Overflow)?;
    state.set_nonce(&sender, nonce + 1);
    let gas = tx.gas() - intrinsic;

    let mut messages = Vec::new();
    let (res, contract) = match tx.to() {
        None => {
            // the value is spent even if the init code fails
            state.sub_balance(&sender, tx.value()).ok_or(TxError::Overflow)?;
            let addr = create_addr(&sender, nonce);
            let snapshot = state.snapshot();
            state.create_account(&addr);
            state.add_balance(&addr, tx.value()).ok_or(TxError::Overflow)?;
            let init = Arc::new(PlainCode::new(tx.data().to_vec().into()));
            let ctx = TxExecContext::new(state, env, sender.clone(), price.clone());
            let res = ctx.run(
                sender.clone(),
                addr.clone(),
                init,
                Vec::new().into(),
                tx.value().clone(),
                gas,
            );
            match &res {
                TxExecResult::Succeeded(code, _, _) => state.set_code(&addr, code),
                TxExecResult::Failed(_) => state.rollback(snapshot),
            }
            (res, Some(addr))
        }
        Some(to) => {
            let snapshot = state.snapshot();
            if !state.exist(to) {
                state.create_account(to);
            }
            state
                .transfer_balance(&sender, to, tx.value())
                .ok_or(TxError::Overflow)?;
            let code = state.get_code(to);
            let ctx = TxExecContext::new(state, env, sender.clone(), price.clone());
            let res = ctx.run(
                sender.clone(),
                to.clone(),
                code,
                tx.data().to_vec().into(),
                tx.value().clone(),
                gas,
            );
            if let TxExecResult::Failed(_) = res {
                state.rollback(snapshot);
            }
            (res, None)
        }
    };

    let to = contract.clone().or_else(|| tx.to().cloned()).unwrap_or_default();
    let (mut left, failed, output, posts) = match res {
        TxExecResult::Succeeded(out, left, posts) => (left, None, out, posts),
        TxExecResult::Failed(e) => {
            debug!("tx {} failed in the vm: {}", tx.hash(), e);
            (0, Some(e), Bytes::empty(), Vec::new())
        }
    };
    messages.push(Message {
        block_number: env.block.number,
        origin: sender.clone(),
        from: sender.clone(),
        to,
        value: tx.value().clone(),
        input: tx.data().clone(),
        output: output.clone(),
        created: contract.is_some(),
        failed: failed.is_some(),
    });

    for msg in posts {
        let res = apply_message(state, env, &sender, &price, &msg);
        trace!("posted message to {} finished: {:?}", msg.to, res);
        left += res.unused_gas();
        let (out, ok) = match res {
            TxExecResult::Succeeded(out, _, _) => (out, true),
            TxExecResult::Failed(_) => (Bytes::empty(), false),
        };
        messages.push(Message {
            block_number: env.block.number,
            origin: sender.clone(),
            from: sender.clone(),
            to: msg.to,
            value: msg.value,
            input: msg.input,
            output: out,
            created: false,
            failed: !ok,
        });
    }

    // refund the sender, pay the coinbase for what was burnt
    let used = tx.gas() - left;
    state
        .add_balance(&sender, &wei_mul(left, &price)?)
        .ok_or(TxError::Overflow)?;
    pool.add(left);
    state
        .add_balance(&env.block.coinbase, &wei_mul(used, &price)?)
        .ok_or(TxError::Overflow)?;

    Ok(Outcome {
        gas_used: used,
        gas_refunded: left,
        failed,
        contract: contract.filter(|_| failed.is_none()),
        output,
        messages,
    })
}

/// Balance needed to send `tx`: its value plus all of its gas.
pub fn upfront_cost(tx: &Tx) -> Option<U256> {
    U256::from(tx.gas())
        .checked_mul(tx.gas_price().clone().into())?
        .checked_add(tx.value().clone().into())
}
