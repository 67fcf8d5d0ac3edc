use crate::instr::{Instr, INSTR_SIZE, NO_ARG};
use crate::op::Op;

/// A forward branch whose target has not been bound yet.
///
/// Created by the branch emitters; resolve with [`Builder::bind`].
#[derive(Debug)]
pub struct Label {
    instr: usize,
}

/// Builds a packed instruction stream.
///
/// Branch targets are absolute instruction indices. Forward branches emit a
/// placeholder and patch it at [`Builder::bind`]; backward branches take an
/// index obtained from [`Builder::here`].
pub struct Builder {
    code: Vec<u8>,
}

impl Builder {
    pub fn new() -> Self {
        Builder { code: Vec::new() }
    }

    /// Number of instructions emitted so far.
    pub fn len(&self) -> usize {
        self.code.len() / INSTR_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// The index the next instruction will occupy; use as a backward
    /// branch target.
    pub fn here(&self) -> i16 {
        self.len() as i16
    }

    pub fn emit(&mut self, op: Op, a: i16, b: i16) {
        Instr::new(op, a, b).encode_into(&mut self.code);
    }

    pub fn emit0(&mut self, op: Op) {
        self.emit(op, NO_ARG, NO_ARG);
    }

    pub fn emit1(&mut self, op: Op, a: i16) {
        self.emit(op, a, NO_ARG);
    }

    // ── branches ───────────────────────────────────────────────────

    /// `jump` with a forward target.
    pub fn jump(&mut self) -> Label {
        self.branch(Op::Jump)
    }

    /// `tjump` with a forward target.
    pub fn tjump(&mut self) -> Label {
        self.branch(Op::TJump)
    }

    /// `fjump` with a forward target.
    pub fn fjump(&mut self) -> Label {
        self.branch(Op::FJump)
    }

    /// `save` of a return point bound later.
    pub fn save(&mut self) -> Label {
        self.branch(Op::Save)
    }

    /// Bind a forward branch to the current position.
    pub fn bind(&mut self, label: Label) {
        let target = self.len() as i16;
        self.patch_a(label.instr, target);
    }

    fn branch(&mut self, op: Op) -> Label {
        let label = Label { instr: self.len() };
        self.emit(op, NO_ARG, NO_ARG);
        label
    }

    fn patch_a(&mut self, instr: usize, a: i16) {
        let offset = instr * INSTR_SIZE + 2;
        self.code[offset..offset + 2].copy_from_slice(&a.to_le_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.code
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.code
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
