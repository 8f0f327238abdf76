use anyhow::Result;
use engram_facts::protocol::{
    Conflict, Effect, FactRecord, Frame, RevisionRecord, SubscriptionId,
};
use engram_facts::{
    Address, Assertion, Commit, Entity, Fact, MediaType, Reference, Revision, RevisionArchive,
    Space, StoredFact, to_canonical_bytes,
};
use pretty_assertions::assert_eq;
use serde_json::json;

#[cfg(target_arch = "wasm32")]
use wasm_bindgen_test::wasm_bindgen_test;
#[cfg(target_arch = "wasm32")]
wasm_bindgen_test::wasm_bindgen_test_configure!(run_in_dedicated_worker);

fn subject() -> Result<Entity> {
    Ok("test:subject".parse()?)
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), test)]
fn it_chains_assert_retract_assert() -> Result<()> {
    let first = Assertion {
        the: MediaType::json(),
        of: subject()?,
        is: json!({ "value": 1 }),
        cause: None,
    };

    let retraction = first.clone().retract()?;
    assert_eq!(retraction.cause, first.reference()?);

    let second = Fact::Retraction(retraction.clone()).update(json!({ "value": 2 }))?;
    assert_eq!(second.cause(), Some(&retraction.reference()?));

    // Three generations, three distinct references
    let references = [
        first.reference()?,
        retraction.reference()?,
        second.reference()?.expect("an assertion has content"),
    ];
    assert_ne!(references[0], references[1]);
    assert_ne!(references[1], references[2]);
    assert_ne!(references[0], references[2]);

    Ok(())
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), test)]
fn it_hashes_identically_across_reconstruction() -> Result<()> {
    let assertion = Assertion {
        the: MediaType::json(),
        of: subject()?,
        is: json!({ "nested": { "z": 1, "a": [true, null] } }),
        cause: Some(Reference::of(&json!("ancestor"))?),
    };

    // A record observed over the wire reconstructs to the same reference
    let record = FactRecord {
        is: Some(assertion.is.clone()),
        cause: assertion.cause,
        reference: assertion.reference()?,
        version: 4,
    };

    let revision = record.to_revision(MediaType::json(), subject()?)?;

    assert_eq!(
        revision.fact.reference()?,
        Some(assertion.reference()?)
    );

    Ok(())
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), test)]
fn it_round_trips_commits_and_effects() -> Result<()> {
    let space = Space::generate()?;
    let assertion = Assertion {
        the: MediaType::json(),
        of: subject()?,
        is: json!({ "value": 1 }),
        cause: None,
    };

    let commit = Commit {
        version: 9,
        facts: vec![StoredFact::try_from(Fact::from(assertion.clone()))?],
        parent: Some(Reference::of(&json!("previous"))?),
    };

    // The commit is its own fact, addressed under the space entity
    let head = commit.to_fact(&space)?;
    assert_eq!(head.cause, commit.parent);

    let frame = Frame::Effect(Effect {
        source: SubscriptionId(3),
        commit: commit.clone(),
        revisions: vec![RevisionRecord {
            the: MediaType::json(),
            of: subject()?,
            record: FactRecord {
                is: Some(assertion.is.clone()),
                cause: None,
                reference: assertion.reference()?,
                version: 9,
            },
        }],
    });

    let serialized = serde_json::to_string(&frame)?;
    let deserialized: Frame = serde_json::from_str(&serialized)?;
    assert_eq!(frame, deserialized);

    Ok(())
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), test)]
fn it_round_trips_conflicts() -> Result<()> {
    let conflict = Conflict {
        the: MediaType::json(),
        of: subject()?,
        expected: None,
        actual: Some(FactRecord {
            is: Some(json!([1, 2, 3])),
            cause: None,
            reference: Reference::of(&json!([1, 2, 3]))?,
            version: 2,
        }),
    };

    let serialized = serde_json::to_value(&conflict)?;
    let deserialized: Conflict = serde_json::from_value(serialized)?;
    assert_eq!(conflict, deserialized);

    Ok(())
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), test)]
fn it_archives_revisions_canonically() -> Result<()> {
    let assertion = Assertion {
        the: MediaType::json(),
        of: subject()?,
        is: json!({ "deep": { "list": [{ "k": 1 }, null, "s"] } }),
        cause: Some(Reference::of(&json!("ancestor"))?),
    };

    let revision = Revision::new(Fact::from(assertion), 12);

    let archive = RevisionArchive::from(&revision);
    let restored = Revision::try_from(archive.clone())?;

    assert_eq!(revision, restored);
    assert_eq!(
        to_canonical_bytes(&archive)?,
        to_canonical_bytes(&RevisionArchive::from(&restored))?
    );

    Ok(())
}

#[cfg_attr(target_arch = "wasm32", wasm_bindgen_test)]
#[cfg_attr(not(target_arch = "wasm32"), test)]
fn it_never_lets_array_length_into_an_address() -> Result<()> {
    // Paths address data; an array's length is a host-language view and
    // resolves to nothing
    let address = Address::new(MediaType::json(), subject()?, ["items", "length"]);
    let value = json!({ "items": [1, 2, 3] });

    assert_eq!(
        engram_facts::resolve(&value, &address.path),
        engram_facts::Resolution::Absent
    );

    Ok(())
}
