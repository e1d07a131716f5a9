//! WebAssembly value, function and global types as seen by the image core.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Scalar value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
}

impl ValueType {
    /// Binary encoding used in WebAssembly type definitions.
    pub fn code(self) -> u8 {
        match self {
            ValueType::I32 => 0x7f,
            ValueType::I64 => 0x7e,
            ValueType::F32 => 0x7d,
            ValueType::F64 => 0x7c,
        }
    }

    /// Register class of the type.
    pub fn category(self) -> ScalarCategory {
        match self {
            ValueType::I32 | ValueType::I64 => ScalarCategory::Int,
            ValueType::F32 | ValueType::F64 => ScalarCategory::Float,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
        };
        f.write_str(text)
    }
}

/// Register class; indexes the result words of the stack variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarCategory {
    Int = 0,
    Float = 1,
}

/// Function signature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FuncType {
    pub params: Vec<ValueType>,
    pub results: Vec<ValueType>,
}

impl FuncType {
    pub fn new(params: Vec<ValueType>, results: Vec<ValueType>) -> Self {
        Self { params, results }
    }

    /// Entry functions take no parameters and return nothing or an i32.
    pub fn is_entry(&self) -> bool {
        self.params.is_empty()
            && (self.results.is_empty() || self.results.as_slice() == [ValueType::I32])
    }

    /// Start functions take nothing and return nothing.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.results.is_empty()
    }
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, t) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{t}")?;
        }
        write!(f, ")")?;
        match self.results.as_slice() {
            [] => Ok(()),
            [t] => write!(f, " {t}"),
            ts => {
                write!(f, " (")?;
                for (i, t) in ts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{t}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Global variable type packed into a byte: the low bits select the value
/// type and the high bit is the mutability flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalType(pub u8);

impl GlobalType {
    const MUTABLE: u8 = 0x80;

    pub fn new(t: ValueType, mutable: bool) -> Self {
        let index = match t {
            ValueType::I32 => 0,
            ValueType::I64 => 1,
            ValueType::F32 => 2,
            ValueType::F64 => 3,
        };
        Self(index | if mutable { Self::MUTABLE } else { 0 })
    }

    pub fn value_type(self) -> Option<ValueType> {
        match self.0 & !Self::MUTABLE {
            0 => Some(ValueType::I32),
            1 => Some(ValueType::I64),
            2 => Some(ValueType::F32),
            3 => Some(ValueType::F64),
            _ => None,
        }
    }

    pub fn mutable(self) -> bool {
        self.0 & Self::MUTABLE != 0
    }

    /// Encoding used in a WebAssembly global section: value type followed by
    /// mutability flag.
    pub fn encode(self) -> Option<[u8; 2]> {
        let t = self.value_type()?;
        Some([t.code(), self.mutable() as u8])
    }
}
