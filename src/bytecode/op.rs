use serde::{Deserialize, Serialize};

// =============================================================================
// OPCODES
// =============================================================================

/// Operand layout of the three bytes following the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    None,
    /// Three independent bytes.
    Bytes,
    /// One byte, then an unsigned 16-bit value.
    ByteShort,
    /// A signed 16-bit value (jump displacement).
    SignedShort,
    /// The whole 32-bit instruction read as one value; the payload is the
    /// signed 24-bit number above the opcode.
    Immediate,
}

macro_rules! opcodes {
    ($($name:ident = $value:literal => $format:ident,)*) => {
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum OpCode {
            $($name = $value,)*
        }

        impl OpCode {
            pub fn from_byte(byte: u8) -> Option<OpCode> {
                match byte {
                    $($value => Some(OpCode::$name),)*
                    _ => None,
                }
            }

            pub fn format(self) -> Format {
                match self {
                    $(OpCode::$name => Format::$format,)*
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(OpCode::$name => stringify!($name),)*
                }
            }
        }
    };
}

opcodes! {
    // control flow
    Halt = 0x00 => None,
    Yield = 0x01 => None,
    Jump = 0x02 => SignedShort,
    JumpIfFalse = 0x03 => SignedShort,
    Call = 0x04 => ByteShort,
    Return = 0x05 => Bytes,
    CallExternal = 0x06 => ByteShort,

    // stack
    PushImmediate = 0x10 => Immediate,
    LoadConstant = 0x11 => ByteShort,
    LoadHeapConstant = 0x12 => ByteShort,
    PushZero = 0x13 => ByteShort,
    Pop = 0x14 => ByteShort,
    Duplicate = 0x15 => Bytes,
    LoadVariable = 0x16 => ByteShort,
    StoreVariable = 0x17 => ByteShort,
    LoadGlobal = 0x18 => ByteShort,
    StoreGlobal = 0x19 => ByteShort,
    Select = 0x1A => Bytes,
    StoreTop = 0x1B => ByteShort,

    // addressing
    AddressOf = 0x20 => ByteShort,
    LoadIndirect = 0x21 => ByteShort,
    StoreIndirect = 0x22 => ByteShort,
    OffsetAddress = 0x23 => ByteShort,
    IndexAddress = 0x24 => ByteShort,

    // integer arithmetic
    AddInt = 0x30 => None,
    SubtractInt = 0x31 => None,
    MultiplyInt = 0x32 => None,
    DivideInt = 0x33 => None,
    ModuloInt = 0x34 => None,
    NegateInt = 0x35 => None,

    // float arithmetic
    AddFloat = 0x38 => None,
    SubtractFloat = 0x39 => None,
    MultiplyFloat = 0x3A => None,
    DivideFloat = 0x3B => None,
    NegateFloat = 0x3C => None,

    // comparison
    LessInt = 0x40 => None,
    LessEqualInt = 0x41 => None,
    GreaterInt = 0x42 => None,
    GreaterEqualInt = 0x43 => None,
    LessFloat = 0x44 => None,
    LessEqualFloat = 0x45 => None,
    GreaterFloat = 0x46 => None,
    GreaterEqualFloat = 0x47 => None,
    Equal = 0x48 => Bytes,
    NotEqual = 0x49 => Bytes,

    // logic and conversion
    And = 0x50 => None,
    Or = 0x51 => None,
    Not = 0x52 => None,
    IntToFloat = 0x53 => None,
    FloatToInt = 0x54 => None,

    // heap
    New = 0x60 => ByteShort,
    FreeHeap = 0x61 => ByteShort,
    ListNew = 0x62 => ByteShort,
    ListPush = 0x63 => Bytes,
    ListLength = 0x64 => None,
    ListIndex = 0x65 => Bytes,
    ListFree = 0x66 => Bytes,
}

// =============================================================================
// INSTRUCTION - fixed 4-byte encoding
// =============================================================================

/// One encoded instruction: byte 0 is the opcode, bytes 1..4 the operands in
/// the opcode's [`Format`]. 16-bit operands are little-endian in bytes 2..4.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction(pub [u8; 4]);

/// Largest magnitude representable by [`Format::Immediate`].
pub const IMMEDIATE_MIN: i32 = -(1 << 23);
pub const IMMEDIATE_MAX: i32 = (1 << 23) - 1;

impl Instruction {
    pub fn none(op: OpCode) -> Self {
        Instruction([op as u8, 0, 0, 0])
    }

    pub fn bytes(op: OpCode, a: u8, b: u8, c: u8) -> Self {
        Instruction([op as u8, a, b, c])
    }

    pub fn byte_short(op: OpCode, byte: u8, short: u16) -> Self {
        let [lo, hi] = short.to_le_bytes();
        Instruction([op as u8, byte, lo, hi])
    }

    pub fn signed(op: OpCode, value: i16) -> Self {
        let [lo, hi] = value.to_le_bytes();
        Instruction([op as u8, 0, lo, hi])
    }

    /// `value` must lie within [`IMMEDIATE_MIN`]..=[`IMMEDIATE_MAX`].
    pub fn immediate(op: OpCode, value: i32) -> Self {
        let raw = ((value as u32) << 8) | op as u32;
        Instruction(raw.to_le_bytes())
    }

    pub fn opcode_byte(self) -> u8 {
        self.0[0]
    }

    pub fn opcode(self) -> Option<OpCode> {
        OpCode::from_byte(self.0[0])
    }

    pub fn a(self) -> u8 {
        self.0[1]
    }

    pub fn b(self) -> u8 {
        self.0[2]
    }

    pub fn c(self) -> u8 {
        self.0[3]
    }

    pub fn short(self) -> u16 {
        u16::from_le_bytes([self.0[2], self.0[3]])
    }

    pub fn signed_short(self) -> i16 {
        i16::from_le_bytes([self.0[2], self.0[3]])
    }

    pub fn raw(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub fn immediate_value(self) -> i32 {
        (self.raw() as i32) >> 8
    }

    /// Back-patch helper: same opcode, new displacement.
    pub fn with_signed(self, value: i16) -> Self {
        let [lo, hi] = value.to_le_bytes();
        Instruction([self.0[0], self.0[1], lo, hi])
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Some(op) = self.opcode() else {
            return write!(f, "<invalid {:#04x}>", self.opcode_byte());
        };
        match op.format() {
            Format::None => write!(f, "{}", op.mnemonic()),
            Format::Bytes => write!(f, "{}({}, {}, {})", op.mnemonic(), self.a(), self.b(), self.c()),
            Format::ByteShort => write!(f, "{}({}, {})", op.mnemonic(), self.a(), self.short()),
            Format::SignedShort => write!(f, "{}({})", op.mnemonic(), self.signed_short()),
            Format::Immediate => write!(f, "{}({})", op.mnemonic(), self.immediate_value()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_is_byte_zero() {
        let inst = Instruction::byte_short(OpCode::LoadVariable, 2, 0x1234);
        assert_eq!(inst.0, [OpCode::LoadVariable as u8, 2, 0x34, 0x12]);
        assert_eq!(inst.opcode(), Some(OpCode::LoadVariable));
        assert_eq!(inst.a(), 2);
        assert_eq!(inst.short(), 0x1234);
    }

    #[test]
    fn test_signed_displacement() {
        let inst = Instruction::signed(OpCode::Jump, -7);
        assert_eq!(inst.signed_short(), -7);
        assert_eq!(inst.with_signed(300).signed_short(), 300);
        assert_eq!(inst.with_signed(300).opcode(), Some(OpCode::Jump));
    }

    #[test]
    fn test_immediate_extremes() {
        for value in [0, 1, -1, 65536, -19, IMMEDIATE_MAX, IMMEDIATE_MIN] {
            let inst = Instruction::immediate(OpCode::PushImmediate, value);
            assert_eq!(inst.opcode(), Some(OpCode::PushImmediate));
            assert_eq!(inst.immediate_value(), value, "value {}", value);
        }
    }

    #[test]
    fn test_unknown_opcode() {
        let inst = Instruction([0xFF, 0, 0, 0]);
        assert_eq!(inst.opcode(), None);
        assert_eq!(format!("{:?}", inst), "<invalid 0xff>");
    }

    #[test]
    fn test_formats_are_per_opcode() {
        assert_eq!(OpCode::JumpIfFalse.format(), Format::SignedShort);
        assert_eq!(OpCode::Select.format(), Format::Bytes);
        assert_eq!(OpCode::Call.format(), Format::ByteShort);
        assert_eq!(OpCode::from_byte(OpCode::ListFree as u8), Some(OpCode::ListFree));
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(
            format!("{:?}", Instruction::bytes(OpCode::Select, 1, 2, 5)),
            "Select(1, 2, 5)"
        );
        assert_eq!(format!("{:?}", Instruction::none(OpCode::AddInt)), "AddInt");
    }
}
