use crate::lang::value::VarType;

// =============================================================================
// OP - Bytecode instructions
// =============================================================================
//
// Every instruction is a one-byte opcode followed by fixed-width little-endian
// immediates. Binary instructions pop `upper` (the right operand) and then
// `lower` (the left operand) and compute `lower OP upper`.

macro_rules! define_ops {
    ($( $(#[$meta:meta])* $name:ident = $code:literal, $mnemonic:literal, $len:literal; )*) => {
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Op {
            $( $(#[$meta])* $name = $code, )*
        }

        impl Op {
            pub fn from_byte(byte: u8) -> Option<Op> {
                match byte {
                    $( $code => Some(Op::$name), )*
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Op::$name => $mnemonic, )*
                }
            }

            /// Encoded length in bytes, opcode included.
            pub fn len(self) -> usize {
                match self {
                    $( Op::$name => $len, )*
                }
            }
        }
    };
}

define_ops! {
    // literals
    /// Push the f64 immediate.
    DLoad = 1, "DLOAD", 9;
    /// Push the i64 immediate.
    ILoad = 2, "ILOAD", 9;
    /// Push a string constant by 2-byte id.
    SLoad = 3, "SLOAD", 3;
    DLoad0 = 4, "DLOAD0", 1;
    ILoad0 = 5, "ILOAD0", 1;
    /// Push the empty string.
    SLoad0 = 6, "SLOAD0", 1;
    DLoad1 = 7, "DLOAD1", 1;
    ILoad1 = 8, "ILOAD1", 1;
    DLoadM1 = 9, "DLOADM1", 1;
    ILoadM1 = 10, "ILOADM1", 1;

    // arithmetic
    DAdd = 11, "DADD", 1;
    IAdd = 12, "IADD", 1;
    DSub = 13, "DSUB", 1;
    ISub = 14, "ISUB", 1;
    DMul = 15, "DMUL", 1;
    IMul = 16, "IMUL", 1;
    DDiv = 17, "DDIV", 1;
    /// Faults on a zero divisor.
    IDiv = 18, "IDIV", 1;
    /// Faults on a zero divisor.
    IMod = 19, "IMOD", 1;
    DNeg = 20, "DNEG", 1;
    INeg = 21, "INEG", 1;
    IAOr = 22, "IAOR", 1;
    IAAnd = 23, "IAAND", 1;
    IAXor = 24, "IAXOR", 1;

    // I/O
    IPrint = 25, "IPRINT", 1;
    DPrint = 26, "DPRINT", 1;
    SPrint = 27, "SPRINT", 1;

    // conversion
    I2D = 28, "I2D", 1;
    D2I = 29, "D2I", 1;

    // stack ops
    Swap = 30, "SWAP", 1;
    Pop = 31, "POP", 1;

    // own activation, fixed slot
    LoadDVar0 = 32, "LOADDVAR0", 1;
    LoadDVar1 = 33, "LOADDVAR1", 1;
    LoadDVar2 = 34, "LOADDVAR2", 1;
    LoadDVar3 = 35, "LOADDVAR3", 1;
    LoadIVar0 = 36, "LOADIVAR0", 1;
    LoadIVar1 = 37, "LOADIVAR1", 1;
    LoadIVar2 = 38, "LOADIVAR2", 1;
    LoadIVar3 = 39, "LOADIVAR3", 1;
    LoadSVar0 = 40, "LOADSVAR0", 1;
    LoadSVar1 = 41, "LOADSVAR1", 1;
    LoadSVar2 = 42, "LOADSVAR2", 1;
    LoadSVar3 = 43, "LOADSVAR3", 1;
    StoreDVar0 = 44, "STOREDVAR0", 1;
    StoreDVar1 = 45, "STOREDVAR1", 1;
    StoreDVar2 = 46, "STOREDVAR2", 1;
    StoreDVar3 = 47, "STOREDVAR3", 1;
    StoreIVar0 = 48, "STOREIVAR0", 1;
    StoreIVar1 = 49, "STOREIVAR1", 1;
    StoreIVar2 = 50, "STOREIVAR2", 1;
    StoreIVar3 = 51, "STOREIVAR3", 1;
    StoreSVar0 = 52, "STORESVAR0", 1;
    StoreSVar1 = 53, "STORESVAR1", 1;
    StoreSVar2 = 54, "STORESVAR2", 1;
    StoreSVar3 = 55, "STORESVAR3", 1;

    // own activation, 2-byte slot
    LoadDVar = 56, "LOADDVAR", 3;
    LoadIVar = 57, "LOADIVAR", 3;
    LoadSVar = 58, "LOADSVAR", 3;
    StoreDVar = 59, "STOREDVAR", 3;
    StoreIVar = 60, "STOREIVAR", 3;
    StoreSVar = 61, "STORESVAR", 3;

    // enclosing activation: 2-byte context hops, 2-byte slot
    LoadCtxDVar = 62, "LOADCTXDVAR", 5;
    LoadCtxIVar = 63, "LOADCTXIVAR", 5;
    LoadCtxSVar = 64, "LOADCTXSVAR", 5;
    StoreCtxDVar = 65, "STORECTXDVAR", 5;
    StoreCtxIVar = 66, "STORECTXIVAR", 5;
    StoreCtxSVar = 67, "STORECTXSVAR", 5;

    // comparison
    /// Push `cmp(lower, upper)` as -1, 0 or 1.
    DCmp = 68, "DCMP", 1;
    /// Push `cmp(lower, upper)` as -1, 0 or 1.
    ICmp = 69, "ICMP", 1;

    // jumps: 2-byte signed offset from the byte after the offset field
    Ja = 70, "JA", 3;
    IfICmpNe = 71, "IFICMPNE", 3;
    IfICmpE = 72, "IFICMPE", 3;
    IfICmpG = 73, "IFICMPG", 3;
    IfICmpGe = 74, "IFICMPGE", 3;
    IfICmpL = 75, "IFICMPL", 3;
    IfICmpLe = 76, "IFICMPLE", 3;

    Stop = 77, "STOP", 1;
    /// Call a bytecode function by 2-byte id.
    Call = 78, "CALL", 3;
    /// Call a native descriptor by 2-byte id.
    CallNative = 79, "CALLNATIVE", 3;
    Return = 80, "RETURN", 1;
}

/// Immediate operand layout of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    Int,
    Double,
    Constant,
    Slot,
    Context,
    Branch,
    Function,
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Load,
    Store,
}

/// How a variable instruction addresses its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// Own activation, slot encoded in the opcode.
    Fixed(u16),
    /// Own activation, 2-byte slot immediate.
    Local,
    /// 2-byte context hops and 2-byte slot immediates.
    Context,
}

/// Decoded meaning of a variable load/store opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarAccess {
    pub access: Access,
    pub ty: VarType,
    pub addressing: Addressing,
}

const FIXED_LOADS: [[Op; 4]; 3] = [
    [Op::LoadDVar0, Op::LoadDVar1, Op::LoadDVar2, Op::LoadDVar3],
    [Op::LoadIVar0, Op::LoadIVar1, Op::LoadIVar2, Op::LoadIVar3],
    [Op::LoadSVar0, Op::LoadSVar1, Op::LoadSVar2, Op::LoadSVar3],
];

const FIXED_STORES: [[Op; 4]; 3] = [
    [Op::StoreDVar0, Op::StoreDVar1, Op::StoreDVar2, Op::StoreDVar3],
    [Op::StoreIVar0, Op::StoreIVar1, Op::StoreIVar2, Op::StoreIVar3],
    [Op::StoreSVar0, Op::StoreSVar1, Op::StoreSVar2, Op::StoreSVar3],
];

fn type_row(ty: VarType) -> Option<usize> {
    match ty {
        VarType::Double => Some(0),
        VarType::Int => Some(1),
        VarType::String => Some(2),
        _ => None,
    }
}

const ROW_TYPES: [VarType; 3] = [VarType::Double, VarType::Int, VarType::String];

impl Op {
    pub fn operand_kind(self) -> OperandKind {
        use Op::*;
        match self {
            DLoad => OperandKind::Double,
            ILoad => OperandKind::Int,
            SLoad => OperandKind::Constant,
            LoadDVar | LoadIVar | LoadSVar | StoreDVar | StoreIVar | StoreSVar => {
                OperandKind::Slot
            }
            LoadCtxDVar | LoadCtxIVar | LoadCtxSVar | StoreCtxDVar | StoreCtxIVar
            | StoreCtxSVar => OperandKind::Context,
            Ja | IfICmpNe | IfICmpE | IfICmpG | IfICmpGe | IfICmpL | IfICmpLe => {
                OperandKind::Branch
            }
            Call => OperandKind::Function,
            CallNative => OperandKind::Native,
            _ => OperandKind::None,
        }
    }

    pub fn is_branch(self) -> bool {
        self.operand_kind() == OperandKind::Branch
    }

    /// Pick the load/store opcode for a variable of type `ty` at
    /// `(context, slot)`, preferring the shortest encoding.
    pub fn var(access: Access, ty: VarType, context: u16, slot: u16) -> Option<(Op, Operand)> {
        let row = type_row(ty)?;

        if context == 0 && slot < 4 {
            let table = match access {
                Access::Load => &FIXED_LOADS,
                Access::Store => &FIXED_STORES,
            };
            return Some((table[row][slot as usize], Operand::None));
        }

        if context == 0 {
            let op = match access {
                Access::Load => [Op::LoadDVar, Op::LoadIVar, Op::LoadSVar][row],
                Access::Store => [Op::StoreDVar, Op::StoreIVar, Op::StoreSVar][row],
            };
            return Some((op, Operand::Slot(slot)));
        }

        let op = match access {
            Access::Load => [Op::LoadCtxDVar, Op::LoadCtxIVar, Op::LoadCtxSVar][row],
            Access::Store => [Op::StoreCtxDVar, Op::StoreCtxIVar, Op::StoreCtxSVar][row],
        };
        Some((op, Operand::Context { context, slot }))
    }

    /// Inverse of [`Op::var`]: `None` for anything that is not a variable
    /// load/store.
    pub fn var_access(self) -> Option<VarAccess> {
        let code = self as u8;
        let (access, ty, addressing) = match code {
            32..=43 => {
                let i = (code - 32) as usize;
                (Access::Load, ROW_TYPES[i / 4], Addressing::Fixed((i % 4) as u16))
            }
            44..=55 => {
                let i = (code - 44) as usize;
                (Access::Store, ROW_TYPES[i / 4], Addressing::Fixed((i % 4) as u16))
            }
            56..=58 => (Access::Load, ROW_TYPES[(code - 56) as usize], Addressing::Local),
            59..=61 => (Access::Store, ROW_TYPES[(code - 59) as usize], Addressing::Local),
            62..=64 => (Access::Load, ROW_TYPES[(code - 62) as usize], Addressing::Context),
            65..=67 => (Access::Store, ROW_TYPES[(code - 65) as usize], Addressing::Context),
            _ => return None,
        };
        Some(VarAccess {
            access,
            ty,
            addressing,
        })
    }
}

/// Decoded immediate operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    None,
    Int(i64),
    Double(f64),
    /// Constant, function or native id.
    Id(u16),
    Slot(u16),
    Context { context: u16, slot: u16 },
    Branch(i16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid opcode {byte:#04x} at offset {offset}")]
    InvalidOpcode { offset: usize, byte: u8 },

    #[error("truncated {mnemonic} at offset {offset}")]
    Truncated {
        offset: usize,
        mnemonic: &'static str,
    },
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    pub op: Op,
    pub offset: usize,
    pub operand: Operand,
}

impl Instruction {
    pub fn decode(code: &[u8], offset: usize) -> Result<Instruction, DecodeError> {
        let byte = *code.get(offset).ok_or(DecodeError::Truncated {
            offset,
            mnemonic: "<opcode>",
        })?;
        let op = Op::from_byte(byte).ok_or(DecodeError::InvalidOpcode { offset, byte })?;

        let truncated = DecodeError::Truncated {
            offset,
            mnemonic: op.mnemonic(),
        };
        if offset + op.len() > code.len() {
            return Err(truncated);
        }

        let at = offset + 1;
        let operand = match op.operand_kind() {
            OperandKind::None => Operand::None,
            OperandKind::Int => Operand::Int(read_i64(code, at).ok_or(truncated)?),
            OperandKind::Double => Operand::Double(read_f64(code, at).ok_or(truncated)?),
            OperandKind::Constant | OperandKind::Function | OperandKind::Native => {
                Operand::Id(read_u16(code, at).ok_or(truncated)?)
            }
            OperandKind::Slot => Operand::Slot(read_u16(code, at).ok_or(truncated)?),
            OperandKind::Context => Operand::Context {
                context: read_u16(code, at).ok_or(truncated)?,
                slot: read_u16(code, at + 2).ok_or(truncated)?,
            },
            OperandKind::Branch => Operand::Branch(read_i16(code, at).ok_or(truncated)?),
        };

        Ok(Instruction {
            op,
            offset,
            operand,
        })
    }

    /// Offset of the following instruction.
    pub fn next(&self) -> usize {
        self.offset + self.op.len()
    }

    /// Absolute branch target, measured from the byte after the offset field.
    pub fn branch_target(&self) -> Option<i64> {
        match self.operand {
            Operand::Branch(off) => Some(self.next() as i64 + off as i64),
            _ => None,
        }
    }
}

pub fn read_u16(code: &[u8], at: usize) -> Option<u16> {
    let bytes = code.get(at..at + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn read_i16(code: &[u8], at: usize) -> Option<i16> {
    read_u16(code, at).map(|v| v as i16)
}

pub fn read_i64(code: &[u8], at: usize) -> Option<i64> {
    let bytes: [u8; 8] = code.get(at..at + 8)?.try_into().ok()?;
    Some(i64::from_le_bytes(bytes))
}

pub fn read_f64(code: &[u8], at: usize) -> Option<f64> {
    let bytes: [u8; 8] = code.get(at..at + 8)?.try_into().ok()?;
    Some(f64::from_le_bytes(bytes))
}
