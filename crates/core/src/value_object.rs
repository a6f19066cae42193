//! Value object trait: equality by value, not identity.
//!
//! Rate periods, extra charges and settlement summaries are value objects: two
//! instances with the same fields are interchangeable.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**. To "modify" one,
/// build a new one.
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Eq)]
/// struct RatePeriod { value: u32, unit: PeriodUnit }
///
/// impl ValueObject for RatePeriod {}
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
