/// Bytecode opcodes.
///
/// Each instruction occupies three 16-bit slots: the opcode and two
/// arguments, with `-1` filling unused slots. Jump and save targets are
/// absolute instruction indices; `const`, `fn`, `gvar`, and `gset` carry
/// constant-pool indices; `callj`/`fcallj` carry a signed argument count
/// where `-1` means apply (expand a list of arguments from the stack).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    /// Bind exactly `a` arguments into the current frame, newest on top.
    Args = 0,
    /// Bind at least `a` arguments; slot `a` receives the excess as a list.
    ArgsDot,
    /// Yield the top of stack to the saved return record, or to the caller
    /// when only the result remains above the entry mark.
    Return,
    /// Push constant-pool entry `a`.
    Const,
    /// Close constant-pool prototype `a` over the current environment and
    /// push the resulting procedure.
    Fn,
    /// Pop; jump to `a` when the value is falselike.
    FJump,
    /// Pop; jump to `a` when the value is not falselike.
    TJump,
    /// Jump to `a`.
    Jump,
    /// Pop the target and invoke it with `a` arguments, consing a fresh
    /// frame onto the callee's captured environment.
    FCallJ,
    /// Pop the target and tail-invoke it with `a` arguments, splicing the
    /// callee's captured environment under the current spine cell.
    CallJ,
    /// Push the value at frame `a`, slot `b`.
    LVar,
    /// Push a return record for resumption at instruction `a`.
    Save,
    /// Push the value of the global named by constant-pool symbol `a`.
    GVar,
    /// Write the top of stack (without popping) into frame `a`, slot `b`.
    LSet,
    /// Define or update the global named by constant-pool symbol `a` to the
    /// top of stack (without popping).
    GSet,
    /// Pop a saved operand stack and top; install them.
    SetCC,
    /// Capture the continuation: push a procedure restoring a copy of the
    /// current operand stack.
    CC,
    /// Discard the top of stack.
    Pop,
}

const MNEMONICS: [&str; Op::COUNT] = [
    "args", "argsdot", "return", "const", "fn", "fjump", "tjump", "jump",
    "fcallj", "callj", "lvar", "save", "gvar", "lset", "gset", "setcc", "cc",
    "pop",
];

impl Op {
    pub const COUNT: usize = Op::Pop as usize + 1;

    /// The assembly-level name the compiler emits for this opcode.
    pub const fn mnemonic(self) -> &'static str {
        MNEMONICS[self as usize]
    }

    pub fn from_mnemonic(name: &str) -> Option<Op> {
        MNEMONICS
            .iter()
            .position(|&m| m == name)
            .map(|i| Op::try_from(i as u8).expect("mnemonic table in sync"))
    }

    /// How many argument slots this opcode uses.
    pub const fn arity(self) -> usize {
        match self {
            Op::Return | Op::SetCC | Op::CC | Op::Pop => 0,
            Op::LVar | Op::LSet => 2,
            _ => 1,
        }
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}
