//! Property coverage for `Client`'s prefix-matching invariant (testable property 6): for any
//! sequence of inserts and removals, `stores_matching(prefix)` returns exactly the entries whose
//! path has `prefix` as a prefix — no more, no fewer — at every point along the sequence.

use std::collections::HashSet;

use async_trait::async_trait;
use opcore::context::Context;
use opcore::error::OperationError;
use opcore::operation::{QueryAdapter, QueryOperation};
use opcore::path::Path;
use opcore::{Client, Continuation};
use proptest::prelude::*;

struct Labeled(Path);

#[async_trait]
impl QueryOperation for Labeled {
    type Value = u32;
    type Failure = &'static str;

    fn path(&self) -> Path {
        self.0.clone()
    }

    async fn fetch(
        &self,
        _context: Context,
        _continuation: Continuation<u32, &'static str>,
    ) -> Result<u32, OperationError<&'static str>> {
        Ok(0)
    }
}

const GROUPS: [&str; 3] = ["users", "posts", "comments"];
const IDS: std::ops::Range<u64> = 0..5;

#[derive(Clone, Debug)]
enum Mutation {
    Insert(&'static str, u64),
    Remove(&'static str, u64),
}

fn arb_mutation() -> impl Strategy<Value = Mutation> {
    prop_oneof![
        (prop::sample::select(GROUPS.to_vec()), IDS).prop_map(|(g, i)| Mutation::Insert(g, i)),
        (prop::sample::select(GROUPS.to_vec()), IDS).prop_map(|(g, i)| Mutation::Remove(g, i)),
    ]
}

proptest! {
    #[test]
    fn stores_matching_tracks_exactly_the_live_entries_under_each_prefix(
        mutations in prop::collection::vec(arb_mutation(), 0..40)
    ) {
        let client = Client::without_cache();
        let mut model: HashSet<(&'static str, u64)> = HashSet::new();

        for mutation in &mutations {
            match mutation {
                Mutation::Insert(group, id) => {
                    client.store(QueryAdapter(Labeled(Path::of(*group).append(*id))));
                    model.insert((group, *id));
                }
                Mutation::Remove(group, id) => {
                    client.clear_store(&Path::of(*group).append(*id));
                    model.remove(&(group, *id));
                }
            }
        }

        for group in GROUPS {
            let expected_count = model.iter().filter(|(g, _)| *g == group).count();
            let actual = client.stores_matching(&Path::of(group));
            prop_assert_eq!(actual.len(), expected_count);

            for id in IDS {
                let present = client.store_with_path(&Path::of(group).append(id)).is_some();
                prop_assert_eq!(present, model.contains(&(group, id)));
            }
        }

        // The empty path is a prefix of every live entry.
        prop_assert_eq!(client.stores_matching(&Path::root()).len(), model.len());
    }
}
