//! Link-layer frame data types shared between drivers and the stack

/// Maximum transmission unit of a CAN media interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mtu {
    Classic,
    Fd,
}

impl Mtu {
    pub const fn as_usize(self) -> usize {
        match self {
            Mtu::Classic => 8,
            Mtu::Fd => 64,
        }
    }
}

impl From<Mtu> for usize {
    fn from(value: Mtu) -> Self {
        value.as_usize()
    }
}

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IncorrectMtu;

impl TryFrom<usize> for Mtu {
    type Error = IncorrectMtu;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            8 => Ok(Mtu::Classic),
            64 => Ok(Mtu::Fd),
            _ => Err(IncorrectMtu),
        }
    }
}

/// A data length representable by a CAN DLC
///
/// CAN FD frames support a limited set of data lengths above 8 bytes.
/// Classic frames use the contiguous subset up to 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataLength(u8);

impl DataLength {
    pub const MAX: usize = 64;

    const STEPS: [(usize, usize); 4] = [(0, 1), (8, 4), (24, 8), (32, 16)];

    const fn step_for(value: usize) -> usize {
        if value < 8 {
            Self::STEPS[0].1
        } else if value < 24 {
            Self::STEPS[1].1
        } else if value < 32 {
            Self::STEPS[2].1
        } else {
            Self::STEPS[3].1
        }
    }

    pub const fn new(value: usize) -> Option<Self> {
        let floor = Self::new_floor(value);
        if floor.as_usize() == value {
            Some(floor)
        } else {
            None
        }
    }

    /// The greatest representable length not exceeding `value`.
    pub const fn new_floor(value: usize) -> Self {
        if value >= Self::MAX {
            return Self(Self::MAX as u8);
        }
        let step = Self::step_for(value);
        Self((value / step * step) as u8)
    }

    /// The least representable length not below `value`, if any.
    pub const fn new_ceil(value: usize) -> Option<Self> {
        if value > Self::MAX {
            return None;
        }
        let step = Self::step_for(value);
        Some(Self(value.div_ceil(step).saturating_mul(step) as u8))
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<DataLength> for usize {
    fn from(value: DataLength) -> Self {
        value.as_usize()
    }
}

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidLength;

/// A CAN-frame-compatible data vector, at most 64 bytes, DLC-aligned length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Data {
    length: DataLength,
    bytes: [u8; DataLength::MAX],
}

impl Data {
    /// Creates a vector from a slice whose length is a valid DLC length.
    pub fn new(data: &[u8]) -> Result<Self, InvalidLength> {
        let length = DataLength::new(data.len()).ok_or(InvalidLength)?;
        let mut bytes = [0; DataLength::MAX];
        bytes[..data.len()].copy_from_slice(data);

        Ok(Self { length, bytes })
    }

    pub fn new_zeros(length: DataLength) -> Self {
        Self {
            length,
            bytes: [0; DataLength::MAX],
        }
    }

    pub fn length(&self) -> DataLength {
        self.length
    }
}

impl core::ops::Deref for Data {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes[..usize::from(self.length)]
    }
}

impl core::ops::DerefMut for Data {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes[..usize::from(self.length)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_LENGTHS: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

    #[test]
    fn test_length_rounding() {
        for len in 0usize..=80 {
            let floor = usize::from(DataLength::new_floor(len));
            assert!(VALID_LENGTHS.contains(&floor));
            assert!(floor <= len || len > DataLength::MAX);

            match DataLength::new_ceil(len) {
                Some(ceil) => {
                    let ceil = usize::from(ceil);
                    assert!(VALID_LENGTHS.contains(&ceil));
                    assert!(ceil >= len);
                    // No valid length strictly between `len` and `ceil`.
                    assert!(!VALID_LENGTHS.iter().any(|&v| v >= len && v < ceil));
                }
                None => assert!(len > DataLength::MAX),
            }
        }
    }

    #[test]
    fn test_exact_lengths() {
        for &len in &VALID_LENGTHS {
            assert_eq!(DataLength::new(len).map(usize::from), Some(len));
        }
        assert!(DataLength::new(9).is_none());
        assert!(DataLength::new(63).is_none());
    }

    #[test]
    fn test_data_vector() {
        let data = Data::new(&[1, 2, 3]).unwrap();
        assert_eq!(&*data, &[1, 2, 3]);
        assert!(Data::new(&[0; 9]).is_err());
    }
}
