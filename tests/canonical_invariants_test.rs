// Property tests for canonical identity and bounded evidence.

use proptest::prelude::*;

use cartograph::relationship::{
    canonical_relationship_id, Evidence, RelationType, Relationship, MAX_EVIDENCE,
};
use cartograph::EntityId;

fn id_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9./#:_-]{1,40}"
}

fn rel_type_strategy() -> impl Strategy<Value = RelationType> {
    prop_oneof![
        Just(RelationType::Calls),
        Just(RelationType::References),
        Just(RelationType::Imports),
        Just(RelationType::Extends),
        Just(RelationType::TypeUses),
    ]
}

proptest! {
    /// Canonical identity is a pure function of (from, type, target key).
    #[test]
    fn canonical_id_is_deterministic(
        from in id_strategy(),
        to in id_strategy(),
        rel_type in rel_type_strategy(),
    ) {
        let from = EntityId::new(from).unwrap();
        let to = EntityId::new(to).unwrap();
        let a = canonical_relationship_id(&from, &rel_type, to.as_str());
        let b = canonical_relationship_id(&from, &rel_type, to.as_str());
        prop_assert_eq!(&a, &b);
        prop_assert!(a.starts_with("rel_"));
    }

    /// Distinct inputs yield distinct ids (no trivial collisions).
    #[test]
    fn canonical_id_distinguishes_targets(
        from in id_strategy(),
        to_a in id_strategy(),
        to_b in id_strategy(),
    ) {
        prop_assume!(to_a != to_b);
        let from = EntityId::new(from).unwrap();
        let a = canonical_relationship_id(&from, &RelationType::Calls, &to_a);
        let b = canonical_relationship_id(&from, &RelationType::Calls, &to_b);
        prop_assert_ne!(a, b);
    }

    /// Evidence and locations never exceed the bound after any merge
    /// sequence.
    #[test]
    fn evidence_stays_bounded(sites in prop::collection::vec((1usize..500, 0usize..120), 1..80)) {
        let from = EntityId::new("sym:a.ts#foo").unwrap();
        let to = EntityId::new("sym:b.ts#bar").unwrap();
        let mut base = Relationship::new(from.clone(), to.clone(), RelationType::Calls)
            .with_evidence(Evidence::site("a.ts", 1, 0));
        for (line, column) in sites {
            let observation = Relationship::new(from.clone(), to.clone(), RelationType::Calls)
                .with_evidence(Evidence::site("a.ts", line, column));
            base.merge_observation(&observation);
            prop_assert!(base.evidence.len() <= MAX_EVIDENCE);
            prop_assert!(base.locations.len() <= MAX_EVIDENCE);
        }
        base.normalize().unwrap();
        prop_assert!(base.evidence.len() <= MAX_EVIDENCE);
    }

    /// Merging the same observation twice is idempotent on evidence and
    /// monotonic on occurrence counts.
    #[test]
    fn merge_is_idempotent_on_evidence(line in 1usize..1000) {
        let from = EntityId::new("sym:a.ts#foo").unwrap();
        let to = EntityId::new("sym:b.ts#bar").unwrap();
        let observation = || {
            Relationship::new(from.clone(), to.clone(), RelationType::Calls)
                .with_evidence(Evidence::site("a.ts", line, 0))
        };
        let mut base = observation();
        base.merge_observation(&observation());
        base.merge_observation(&observation());
        prop_assert_eq!(base.evidence.len(), 1);
        prop_assert_eq!(base.occurrences_total, Some(3));
    }
}
