//! The bytecode instruction set.
//!
//! Every indexed opcode has a short form taking a 1-byte operand and a
//! `_LONG` form taking a 3-byte little-endian operand; the compiler picks
//! the short form whenever the index fits. Long forms sit at `short + 1` so
//! [`Opcode::wide`] is a plain increment. Jump opcodes take an unsigned
//! 16-bit distance with direction encoded in the opcode (`LOOP` jumps
//! backward, everything else forward); distances that do not fit divert
//! through the code object's overlong-jump table.

use strum::{FromRepr, IntoStaticStr};

/// Operand encoding of an opcode, for decoding and disassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperandLayout {
    /// No operand bytes.
    None,
    /// One `u8` index or count.
    Byte,
    /// Three bytes, little-endian `u24` index or count.
    Wide,
    /// Two bytes, little-endian `u16` jump distance.
    Jump,
    /// `u8` constant index, then `code.upvalue_count` trailing
    /// `(is_local: u8, index: u16)` capture descriptors.
    ClosureByte,
    /// As above with a `u24` constant index.
    ClosureWide,
    /// `u8` name constant index plus a `u8` argument count.
    MethodByte,
    /// `u24` name constant index plus a `u8` argument count.
    MethodWide,
}

/// A bytecode instruction.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum Opcode {
    // ----- no operand -----
    Return = 0,
    Pop = 1,
    None = 2,
    True = 3,
    False = 4,
    Add = 5,
    Subtract = 6,
    Multiply = 7,
    Divide = 8,
    Floordiv = 9,
    Modulo = 10,
    Pow = 11,
    Bitand = 12,
    Bitor = 13,
    Bitxor = 14,
    Bitshiftl = 15,
    Bitshiftr = 16,
    Negate = 17,
    Not = 18,
    Invert = 19,
    Equal = 20,
    Less = 21,
    Greater = 22,
    LessEqual = 23,
    GreaterEqual = 24,
    Is = 25,
    Contains = 26,
    Inherit = 27,
    CloseUpvalue = 28,
    Raise = 29,
    RaiseFrom = 30,
    FilterExcept = 31,
    InvokeIter = 32,
    InvokeNext = 33,
    Yield = 34,

    // ----- indexed, short/long pairs -----
    Constant = 40,
    ConstantLong = 41,
    DefineGlobal = 42,
    DefineGlobalLong = 43,
    GetGlobal = 44,
    GetGlobalLong = 45,
    SetGlobal = 46,
    SetGlobalLong = 47,
    DelGlobal = 48,
    DelGlobalLong = 49,
    GetLocal = 50,
    GetLocalLong = 51,
    SetLocal = 52,
    SetLocalLong = 53,
    GetUpvalue = 54,
    GetUpvalueLong = 55,
    SetUpvalue = 56,
    SetUpvalueLong = 57,
    GetProperty = 58,
    GetPropertyLong = 59,
    SetProperty = 60,
    SetPropertyLong = 61,
    DelProperty = 62,
    DelPropertyLong = 63,
    GetSuper = 64,
    GetSuperLong = 65,
    Class = 66,
    ClassLong = 67,
    Method = 68,
    MethodLong = 69,
    Call = 70,
    CallLong = 71,
    BuildTuple = 72,
    BuildTupleLong = 73,
    BuildList = 74,
    BuildListLong = 75,
    BuildDict = 76,
    BuildDictLong = 77,
    BuildSet = 78,
    BuildSetLong = 79,
    Unpack = 80,
    UnpackLong = 81,
    Dup = 82,
    DupLong = 83,
    Swap = 84,
    SwapLong = 85,
    Closure = 86,
    ClosureLong = 87,
    CallMethod = 88,
    CallMethodLong = 89,

    // ----- 16-bit jumps -----
    Jump = 100,
    JumpIfFalse = 101,
    JumpIfTrue = 102,
    Loop = 103,
    PushTry = 104,
    PushWith = 105,
}

impl Opcode {
    /// The `_LONG` form of a short indexed opcode.
    ///
    /// # Panics
    /// Panics (in debug builds) when called on an opcode without a long
    /// form; the compiler only widens indexed opcodes.
    #[must_use]
    pub fn wide(self) -> Self {
        debug_assert!(
            matches!(self.layout(), OperandLayout::Byte | OperandLayout::ClosureByte | OperandLayout::MethodByte),
            "opcode {self:?} has no long form"
        );
        Self::from_repr(self as u8 + 1).expect("long form missing from opcode table")
    }

    /// How the operand bytes after this opcode are laid out.
    #[must_use]
    pub fn layout(self) -> OperandLayout {
        match self {
            Self::Closure => OperandLayout::ClosureByte,
            Self::ClosureLong => OperandLayout::ClosureWide,
            Self::CallMethod => OperandLayout::MethodByte,
            Self::CallMethodLong => OperandLayout::MethodWide,
            Self::Jump | Self::JumpIfFalse | Self::JumpIfTrue | Self::Loop | Self::PushTry | Self::PushWith => {
                OperandLayout::Jump
            }
            _ => {
                let repr = self as u8;
                if repr < 40 {
                    OperandLayout::None
                } else if repr % 2 == 0 {
                    OperandLayout::Byte
                } else {
                    OperandLayout::Wide
                }
            }
        }
    }

    /// Whether a jump opcode's distance is applied forward.
    #[must_use]
    pub fn jumps_forward(self) -> bool {
        debug_assert_eq!(self.layout(), OperandLayout::Jump);
        !matches!(self, Self::Loop)
    }

    /// Display name, e.g. `GET_PROPERTY_LONG`.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_repr() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Opcode::from_repr(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(Opcode::from_repr(Opcode::Loop as u8), Some(Opcode::Loop));
        assert_eq!(Opcode::from_repr(250), Option::None);
    }

    #[test]
    fn test_wide_pairs_are_adjacent() {
        assert_eq!(Opcode::Constant.wide(), Opcode::ConstantLong);
        assert_eq!(Opcode::GetProperty.wide(), Opcode::GetPropertyLong);
        assert_eq!(Opcode::CallMethod.wide(), Opcode::CallMethodLong);
        assert_eq!(Opcode::Closure.wide(), Opcode::ClosureLong);
    }

    #[test]
    fn test_layouts() {
        assert_eq!(Opcode::Add.layout(), OperandLayout::None);
        assert_eq!(Opcode::Constant.layout(), OperandLayout::Byte);
        assert_eq!(Opcode::ConstantLong.layout(), OperandLayout::Wide);
        assert_eq!(Opcode::Jump.layout(), OperandLayout::Jump);
        assert_eq!(Opcode::PushTry.layout(), OperandLayout::Jump);
        assert_eq!(Opcode::Closure.layout(), OperandLayout::ClosureByte);
        assert_eq!(Opcode::CallMethodLong.layout(), OperandLayout::MethodWide);
    }

    #[test]
    fn test_jump_direction() {
        assert!(Opcode::Jump.jumps_forward());
        assert!(Opcode::PushWith.jumps_forward());
        assert!(!Opcode::Loop.jumps_forward());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(Opcode::GetProperty.name(), "GET_PROPERTY");
        assert_eq!(Opcode::BuildListLong.name(), "BUILD_LIST_LONG");
        assert_eq!(Opcode::CloseUpvalue.name(), "CLOSE_UPVALUE");
    }
}
