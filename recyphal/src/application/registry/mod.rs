//! Named key/value registry for configuration parameters
//!
//! Registers are appended once (unique short ASCII names, insertion order
//! preserved for introspection) and then read or written through [`get`]
//! and [`set`]. A register is either a stored parameter (mutable or
//! constant, optionally guarded by a validator) or backed by
//! getter/setter closures for values living elsewhere. Written values are
//! coerced into the register's own type with exact value preservation;
//! see [`value`].
//!
//! [`get`]: Registry::get
//! [`set`]: Registry::set

use alloc::boxed::Box;
use alloc::vec::Vec;

mod value;

pub use value::Value;

/// Maximum register name length in bytes.
pub const MAX_NAME_LENGTH: usize = 255;

type Name = heapless::String<MAX_NAME_LENGTH>;
type Getter = Box<dyn Fn() -> Value>;
type Setter = Box<dyn FnMut(&Value) -> bool>;
type Validator = Box<dyn Fn(&Value) -> bool>;

/// Why a `set` was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SetError {
    /// The register is not writable.
    Mutability,
    /// The value could not be converted losslessly into the register type.
    Coercion,
    /// The register (or its validator) vetoed the new value.
    Semantics,
}

/// Why a register could not be appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AppendError {
    NameTaken,
    NameTooLong,
}

/// Per-register creation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Options {
    /// True if the value is retained across application restarts.
    pub persistent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Flags {
    pub mutable: bool,
    pub persistent: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueAndFlags {
    pub value: Value,
    pub flags: Flags,
}

enum Access {
    Param {
        value: Value,
        mutable: bool,
        validator: Option<Validator>,
    },
    Getter {
        getter: Getter,
    },
    GetterSetter {
        getter: Getter,
        setter: Setter,
    },
}

struct Register {
    name: Name,
    options: Options,
    access: Access,
}

impl Register {
    fn get(&self) -> ValueAndFlags {
        let (value, mutable) = match &self.access {
            Access::Param { value, mutable, .. } => (value.clone(), *mutable),
            Access::Getter { getter } => (getter(), false),
            Access::GetterSetter { getter, .. } => (getter(), true),
        };
        ValueAndFlags {
            value,
            flags: Flags {
                mutable,
                persistent: self.options.persistent,
            },
        }
    }

    fn set(&mut self, new_value: &Value) -> Result<(), SetError> {
        match &mut self.access {
            Access::Getter { .. } | Access::Param { mutable: false, .. } => {
                Err(SetError::Mutability)
            }
            Access::Param {
                value, validator, ..
            } => {
                let coerced = new_value
                    .coerced_into_kind_of(value)
                    .ok_or(SetError::Coercion)?;
                if let Some(validator) = validator {
                    if !validator(&coerced) {
                        return Err(SetError::Semantics);
                    }
                }
                *value = coerced;
                Ok(())
            }
            Access::GetterSetter { getter, setter } => {
                let coerced = new_value
                    .coerced_into_kind_of(&getter())
                    .ok_or(SetError::Coercion)?;
                if setter(&coerced) {
                    Ok(())
                } else {
                    Err(SetError::Semantics)
                }
            }
        }
    }
}

/// The register collection.
#[derive(Default)]
pub struct Registry {
    registers: Vec<Register>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Register names in insertion order (the introspection order of the
    /// standard register-list service).
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.registers.iter().map(|register| register.name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<ValueAndFlags> {
        self.find(name).map(Register::get)
    }

    /// Writes a register; `None` when no register has this name.
    pub fn set(&mut self, name: &str, value: &Value) -> Option<Result<(), SetError>> {
        self.registers
            .iter_mut()
            .find(|register| register.name.as_str() == name)
            .map(|register| register.set(value))
    }

    /// Appends a mutable stored parameter.
    pub fn append_parameter(
        &mut self,
        name: &str,
        initial: Value,
        options: Options,
    ) -> Result<(), AppendError> {
        self.append(
            name,
            options,
            Access::Param {
                value: initial,
                mutable: true,
                validator: None,
            },
        )
    }

    /// Appends a mutable stored parameter whose writes must pass the
    /// validator; a veto surfaces as [`SetError::Semantics`].
    pub fn append_parameter_with_validator(
        &mut self,
        name: &str,
        initial: Value,
        options: Options,
        validator: impl Fn(&Value) -> bool + 'static,
    ) -> Result<(), AppendError> {
        self.append(
            name,
            options,
            Access::Param {
                value: initial,
                mutable: true,
                validator: Some(Box::new(validator)),
            },
        )
    }

    /// Appends an immutable stored value.
    pub fn append_constant(
        &mut self,
        name: &str,
        value: Value,
        options: Options,
    ) -> Result<(), AppendError> {
        self.append(
            name,
            options,
            Access::Param {
                value,
                mutable: false,
                validator: None,
            },
        )
    }

    /// Appends a read-only register backed by a getter closure.
    pub fn append_getter(
        &mut self,
        name: &str,
        options: Options,
        getter: impl Fn() -> Value + 'static,
    ) -> Result<(), AppendError> {
        self.append(
            name,
            options,
            Access::Getter {
                getter: Box::new(getter),
            },
        )
    }

    /// Appends a read-write register backed by closures. The setter
    /// receives the already-coerced value and may veto it by returning
    /// false.
    pub fn append_getter_setter(
        &mut self,
        name: &str,
        options: Options,
        getter: impl Fn() -> Value + 'static,
        setter: impl FnMut(&Value) -> bool + 'static,
    ) -> Result<(), AppendError> {
        self.append(
            name,
            options,
            Access::GetterSetter {
                getter: Box::new(getter),
                setter: Box::new(setter),
            },
        )
    }

    fn append(&mut self, name: &str, options: Options, access: Access) -> Result<(), AppendError> {
        let name = Name::try_from(name).map_err(|_| AppendError::NameTooLong)?;
        if self.find(&name).is_some() {
            return Err(AppendError::NameTaken);
        }
        self.registers.push(Register {
            name,
            options,
            access,
        });
        Ok(())
    }

    fn find(&self, name: &str) -> Option<&Register> {
        self.registers
            .iter()
            .find(|register| register.name.as_str() == name)
    }
}
