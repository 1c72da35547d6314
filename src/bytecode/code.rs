use crate::bytecode::op::{Op, Operand};

/// A forward or backward jump target inside one [`Bytecode`] buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Default)]
struct LabelState {
    bound: Option<usize>,
    /// Offsets of 2-byte branch fields waiting for the bind.
    relocations: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    #[error("label {0} bound twice")]
    Rebound(usize),

    #[error("label {0} used but never bound")]
    Unbound(usize),

    #[error("jump from {from} to {to} does not fit a 16-bit offset")]
    OutOfRange { from: usize, to: usize },
}

/// Growable instruction buffer for one function, with label patching.
#[derive(Debug, Default)]
pub struct Bytecode {
    data: Vec<u8>,
    labels: Vec<LabelState>,
    error: Option<LabelError>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset where the next instruction will be written.
    pub fn current(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn add_op(&mut self, op: Op) {
        self.data.push(op as u8);
    }

    pub fn add_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_i16(&mut self, value: i16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_i64(&mut self, value: i64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_f64(&mut self, value: f64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit `op` with its encoded immediate. Branches go through
    /// [`Bytecode::add_branch`].
    pub fn add(&mut self, op: Op, operand: Operand) {
        self.add_op(op);
        match operand {
            Operand::None => {}
            Operand::Int(n) => self.add_i64(n),
            Operand::Double(n) => self.add_f64(n),
            Operand::Id(id) | Operand::Slot(id) => self.add_u16(id),
            Operand::Context { context, slot } => {
                self.add_u16(context);
                self.add_u16(slot);
            }
            Operand::Branch(off) => self.add_i16(off),
        }
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelState::default());
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current offset and patch every pending jump to it.
    pub fn bind(&mut self, label: Label) {
        let here = self.current();
        let state = &mut self.labels[label.0];
        if state.bound.is_some() {
            self.error.get_or_insert(LabelError::Rebound(label.0));
            return;
        }
        state.bound = Some(here);

        let relocations = std::mem::take(&mut state.relocations);
        for at in relocations {
            self.patch(at, here);
        }
    }

    /// Emit a jump instruction to `label`.
    pub fn add_branch(&mut self, op: Op, label: Label) {
        debug_assert!(op.is_branch());
        self.add_op(op);
        let at = self.current();
        match self.labels[label.0].bound {
            Some(target) => {
                self.add_i16(0);
                self.patch(at, target);
            }
            None => {
                self.labels[label.0].relocations.push(at);
                self.add_i16(0);
            }
        }
    }

    // Offsets count from the byte after the 2-byte field.
    fn patch(&mut self, at: usize, target: usize) {
        let offset = target as i64 - (at as i64 + 2);
        match i16::try_from(offset) {
            Ok(off) => self.data[at..at + 2].copy_from_slice(&off.to_le_bytes()),
            Err(_) => {
                self.error.get_or_insert(LabelError::OutOfRange {
                    from: at - 1,
                    to: target,
                });
            }
        }
    }

    /// Finished instruction bytes, or the first label misuse.
    pub fn finish(self) -> Result<Vec<u8>, LabelError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if let Some(idx) = self
            .labels
            .iter()
            .position(|l| l.bound.is_none() && !l.relocations.is_empty())
        {
            return Err(LabelError::Unbound(idx));
        }
        Ok(self.data)
    }
}
