use super::params::*;
use super::ExecError;
use crate::common::U256;

pub struct Stack {
    stack: Vec<U256>,
}

impl Stack {
    pub fn new() -> Self {
        Self { stack: Vec::new() }
    }

    #[inline(always)]
    pub fn push(&mut self, val: U256) -> Result<(), ExecError> {
        if self.stack.len() == MAX_STACK_DEPTH {
            return Err(ExecError::StackOverflow)
        }
        self.stack.push(val);
        Ok(())
    }

    #[inline(always)]
    pub fn dup(&mut self, pos: usize) -> Result<(), ExecError> {
        let top = self.stack.len();
        if pos > top {
            return Err(ExecError::StackUnderflow)
        }
        self.push(self.stack[top - pos])
    }

    #[inline(always)]
    pub fn swap(&mut self, pos: usize) -> Result<(), ExecError> {
        if pos + 1 > self.stack.len() {
            return Err(ExecError::StackUnderflow)
        }
        let top = self.stack.len() - 1;
        self.stack.swap(top, top - pos);
        Ok(())
    }

    #[inline(always)]
    pub fn consume1(&mut self) -> Result<U256, ExecError> {
        self.stack.pop().ok_or(ExecError::StackUnderflow)
    }

    #[inline(always)]
    pub fn consume2(&mut self) -> Result<(U256, U256), ExecError> {
        if self.stack.len() < 2 {
            return Err(ExecError::StackUnderflow)
        }
        Ok((self.consume1()?, self.consume1()?))
    }

    #[inline(always)]
    pub fn consume3(&mut self) -> Result<(U256, U256, U256), ExecError> {
        if self.stack.len() < 3 {
            return Err(ExecError::StackUnderflow)
        }
        Ok((self.consume1()?, self.consume1()?, self.consume1()?))
    }

    /// Pops `n` words, top first. Nothing is popped if the stack is too shallow.
    pub fn consume_n(&mut self, n: usize) -> Result<Vec<U256>, ExecError> {
        if self.stack.len() < n {
            return Err(ExecError::StackUnderflow)
        }
        let at = self.stack.len() - n;
        let mut vals = self.stack.split_off(at);
        vals.reverse();
        Ok(vals)
    }
}

#[test]
fn test_stack_order() {
    let mut s = Stack::new();
    for i in 1..=5u64 {
        s.push(i.into()).unwrap();
    }
    assert_eq!(s.consume2().unwrap(), (5.into(), 4.into()));
    s.swap(2).unwrap();
    assert_eq!(s.consume_n(3).unwrap(), vec![1.into(), 2.into(), 3.into()]);
    assert!(s.consume1().is_err());
    assert!(s.dup(1).is_err());
}
