//! Identity for records that live inside an aggregate or a log: payments,
//! return records, inspection reports and stock movements.

/// A record identified by its own id rather than by its contents.
///
/// Unlike a [`crate::ValueObject`], two entities with equal fields but
/// different ids are different records.
pub trait Entity {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;
}

/// Look up a record by id in an append-only list.
pub fn find_by_id<'a, E: Entity>(records: &'a [E], id: &E::Id) -> Option<&'a E> {
    records.iter().find(|r| r.id() == id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Receipt {
        number: u32,
        amount: i64,
    }

    impl Entity for Receipt {
        type Id = u32;

        fn id(&self) -> &u32 {
            &self.number
        }
    }

    #[test]
    fn finds_by_identity_not_contents() {
        let receipts = [
            Receipt { number: 1, amount: 300 },
            Receipt { number: 2, amount: 300 },
        ];
        assert_eq!(find_by_id(&receipts, &2).map(|r| r.number), Some(2));
        assert_eq!(find_by_id(&receipts, &2).map(|r| r.amount), Some(300));
        assert!(find_by_id(&receipts, &3).is_none());
    }
}
