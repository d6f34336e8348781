/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::ops::Range;

use thiserror::Error;

use crate::vlm_error::VLMError;

/// Nonzero status reported by a populate callback.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("populate status {status}")]
pub struct PopulateError {
    pub status: i32,
}

impl PopulateError {
    pub fn new(status: i32) -> Self {
        debug_assert!(status != 0, "status 0 means success");
        PopulateError { status }
    }
}

/// Handle by which a populate implementation may later be asked to widen
/// its range. Carries nothing today; implementations accept and ignore it.
pub struct PopulateCallout {
    _reserved: (),
}

impl PopulateCallout {
    pub(crate) fn new() -> Self {
        PopulateCallout { _reserved: () }
    }
}

/// The capability a source hands to the core: produce the bytes of an
/// element range.
///
/// `out` is exactly `(range.end - range.start) * element_size` bytes and
/// must be filled completely on success. The implementation is called from
/// worker threads while a host thread is blocked inside a memory read, so
/// it must not touch the object's own range. Dropping the box is the
/// object's destructor path.
pub trait PopulateSource: Send + Sync {
    fn populate(
        &self,
        range: Range<u64>,
        callout: &mut PopulateCallout,
        out: &mut [u8],
    ) -> Result<(), PopulateError>;
}

/// How the host interprets an element. Informational to the core except
/// for the size cross-check in `validate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ElementKind {
    Byte,
    Logical,
    Integer,
    Real,
    Complex,
    Raw,
}

impl ElementKind {
    /// Natural element width, `None` where any width is legal.
    pub fn natural_size(&self) -> Option<usize> {
        match self {
            ElementKind::Byte => Some(1),
            ElementKind::Logical => Some(4),
            ElementKind::Integer => Some(4),
            ElementKind::Real => Some(8),
            ElementKind::Complex => Some(16),
            ElementKind::Raw => None,
        }
    }
}

/// Everything the host fills in to create an object.
pub struct VLMSource {
    pub source: Box<dyn PopulateSource>,
    pub element_kind: ElementKind,
    pub n_elements: u64,
    pub element_size: usize,
    /// Bytes at the start of the range reserved for a host-written header.
    pub header_bytes: usize,
    pub dims: Option<Vec<u64>>,
    /// Lower bound on elements materialized per fault; 0 means the
    /// configured default.
    pub min_load_elements: u64,
}

impl VLMSource {
    pub(crate) fn validate(&self, multidim: bool) -> Result<(), VLMError> {
        if self.n_elements == 0 {
            return Err(VLMError::InvalidSource("n_elements is zero"));
        }
        if self.element_size == 0 {
            return Err(VLMError::InvalidSource("element_size is zero"));
        }
        if let Some(natural) = self.element_kind.natural_size() {
            if natural != self.element_size {
                return Err(VLMError::InvalidSource(
                    "element_size does not match element_kind",
                ));
            }
        }
        if multidim {
            let dims = self
                .dims
                .as_ref()
                .ok_or(VLMError::InvalidSource("multidim object without dims"))?;
            if dims.is_empty() {
                return Err(VLMError::InvalidSource("dims is empty"));
            }
            let product = dims
                .iter()
                .try_fold(1u64, |acc, &d| acc.checked_mul(d))
                .ok_or(VLMError::InvalidSource("dims product overflows"))?;
            if product != self.n_elements {
                return Err(VLMError::InvalidSource("dims product != n_elements"));
            }
        }
        // total range must be addressable
        (self.n_elements as usize)
            .checked_mul(self.element_size)
            .and_then(|bytes| bytes.checked_add(self.header_bytes))
            .ok_or(VLMError::InvalidSource("object range overflows usize"))?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::ops::Range;

    use super::{
        ElementKind, PopulateCallout, PopulateError, PopulateSource, VLMSource,
    };
    use crate::vlm_error::VLMError;

    struct NullSource;

    impl PopulateSource for NullSource {
        fn populate(
            &self,
            _range: Range<u64>,
            _callout: &mut PopulateCallout,
            out: &mut [u8],
        ) -> Result<(), PopulateError> {
            out.fill(0);
            Ok(())
        }
    }

    fn source(n_elements: u64, element_size: usize) -> VLMSource {
        VLMSource {
            source: Box::new(NullSource),
            element_kind: ElementKind::Raw,
            n_elements,
            element_size,
            header_bytes: 0,
            dims: None,
            min_load_elements: 0,
        }
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        assert!(matches!(
            source(0, 4).validate(false),
            Err(VLMError::InvalidSource(_))
        ));
        assert!(matches!(
            source(10, 0).validate(false),
            Err(VLMError::InvalidSource(_))
        ));
        assert!(source(10, 4).validate(false).is_ok());
    }

    #[test]
    fn test_validate_checks_kind_size() {
        let mut src = source(10, 8);
        src.element_kind = ElementKind::Integer;
        assert!(matches!(
            src.validate(false),
            Err(VLMError::InvalidSource(_))
        ));

        src.element_size = 4;
        assert!(src.validate(false).is_ok());
    }

    #[test]
    fn test_validate_checks_dims() {
        let mut src = source(12, 4);
        assert!(matches!(
            src.validate(true),
            Err(VLMError::InvalidSource(_))
        ));

        src.dims = Some(vec![3, 4]);
        assert!(src.validate(true).is_ok());

        src.dims = Some(vec![3, 5]);
        assert!(matches!(
            src.validate(true),
            Err(VLMError::InvalidSource(_))
        ));
    }
}
