use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};

use super::item_cache::ItemCache;
use super::record::DirectoryEntryRecord;
use crate::config::GabConfig;
use crate::store::{DirectoryStore, EntityHandle, LocalEntity};
use crate::types::error::Result;

/// Links mirrored entities into the groups that contain them
///
/// Groups list their members and members list their groups, so whichever
/// side arrives last completes the link.
pub struct MembershipResolver<'a> {
    store: &'a dyn DirectoryStore,
    config: &'a GabConfig,
}

impl<'a> MembershipResolver<'a> {
    pub fn new(store: &'a dyn DirectoryStore, config: &'a GabConfig) -> Self {
        Self { store, config }
    }

    /// Add `member` to every already mirrored group of its `memberOf` list.
    /// Returns the number of groups that gained the member.
    pub fn link_member_to_groups(
        &self,
        cache: &mut ItemCache,
        member: &LocalEntity,
        record: &DirectoryEntryRecord,
    ) -> Result<usize> {
        if !self.config.group_members {
            return Ok(0);
        }

        let mut linked = 0;
        for group_id in record.member_of() {
            let handle = match cache.find(self.store, group_id)? {
                Some(handle) => handle,
                None => {
                    debug!("Group {} of {} not mirrored yet", group_id, record.id);
                    continue;
                }
            };

            let mut group = match self.store.load(&handle)? {
                Some(group) if group.is_group() => group,
                Some(_) => {
                    debug!("{} is not mirrored as a group, not linking {}", group_id, record.id);
                    continue;
                }
                None => continue,
            };

            if self.add_member(&mut group, member)? {
                self.store.save(&group)?;
                linked += 1;
            }
        }
        Ok(linked)
    }

    /// Add `item` to `group` in memory. Returns false when the link is not
    /// made: membership additions disabled, nesting disabled, already a
    /// member, or the link would close a cycle.
    pub fn add_member(&self, group: &mut LocalEntity, item: &LocalEntity) -> Result<bool> {
        if !self.config.group_members_add {
            return Ok(false);
        }

        if item.handle == group.handle {
            warn!("Not adding group {} to itself", group.handle);
            return Ok(false);
        }

        if item.is_group() {
            if !self.config.nested_groups {
                return Ok(false);
            }
            if self.reaches(&item.handle, &group.handle)? {
                warn!(
                    "Not nesting group {} in {}: it would create a cycle",
                    item.handle, group.handle
                );
                return Ok(false);
            }
        }

        Ok(group.add_member(&item.handle))
    }

    /// Whether `target` is reachable from `start` through nested group
    /// membership. A walk deeper than the configured nesting depth is treated
    /// as reaching it.
    fn reaches(&self, start: &EntityHandle, target: &EntityHandle) -> Result<bool> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([(start.clone(), 0usize)]);

        while let Some((handle, depth)) = queue.pop_front() {
            if &handle == target {
                return Ok(true);
            }
            if !visited.insert(handle.clone()) {
                continue;
            }

            let group = match self.store.load(&handle)? {
                Some(group) if group.is_group() => group,
                _ => continue,
            };
            if depth >= self.config.max_nesting_depth {
                warn!("Group nesting below {} exceeds depth {}", start, depth);
                return Ok(true);
            }
            for member in group.members {
                if !visited.contains(&member) {
                    queue.push_back((member, depth + 1));
                }
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::{create_memory_pool, SqliteDirectoryStore};
    use crate::store::{EntityKind, PROP_DIRECTORY_ID};
    use serde_json::json;

    fn store() -> SqliteDirectoryStore {
        SqliteDirectoryStore::new(create_memory_pool().unwrap(), "example.com")
    }

    fn saved(store: &SqliteDirectoryStore, kind: EntityKind, id: &str) -> LocalEntity {
        let mut entity = store.create(kind).unwrap();
        entity.set(PROP_DIRECTORY_ID, id);
        store.save(&entity).unwrap();
        entity
    }

    fn reload(store: &SqliteDirectoryStore, entity: &LocalEntity) -> LocalEntity {
        store.load(&entity.handle).unwrap().unwrap()
    }

    #[test]
    fn test_link_member_to_existing_groups() {
        let store = store();
        let config = GabConfig::default();
        let staff = saved(&store, EntityKind::Group, "staff");
        let alice = saved(&store, EntityKind::Contact, "alice");
        let record = DirectoryEntryRecord::from_json(
            "alice",
            &json!({"type": "contact", "memberOf": ["staff", "not-yet-here"]}),
        )
        .unwrap();

        let resolver = MembershipResolver::new(&store, &config);
        let mut cache = ItemCache::new(true);
        assert_eq!(resolver.link_member_to_groups(&mut cache, &alice, &record).unwrap(), 1);
        // Linking again is a no-op
        assert_eq!(resolver.link_member_to_groups(&mut cache, &alice, &record).unwrap(), 0);

        assert_eq!(reload(&store, &staff).members, vec![alice.handle]);
    }

    #[test]
    fn test_contact_is_never_a_group_target() {
        let store = store();
        let config = GabConfig::default();
        saved(&store, EntityKind::Contact, "bob");
        let alice = saved(&store, EntityKind::Contact, "alice");
        let record = DirectoryEntryRecord::from_json(
            "alice",
            &json!({"type": "contact", "memberOf": ["bob"]}),
        )
        .unwrap();

        let resolver = MembershipResolver::new(&store, &config);
        let mut cache = ItemCache::new(true);
        assert_eq!(resolver.link_member_to_groups(&mut cache, &alice, &record).unwrap(), 0);
    }

    #[test]
    fn test_switches_disable_linking() {
        let store = store();
        let mut group = saved(&store, EntityKind::Group, "outer");
        let inner = saved(&store, EntityKind::Group, "inner");
        let alice = saved(&store, EntityKind::Contact, "alice");

        let no_nesting = GabConfig {
            nested_groups: false,
            ..GabConfig::default()
        };
        let resolver = MembershipResolver::new(&store, &no_nesting);
        assert!(!resolver.add_member(&mut group, &inner).unwrap());
        assert!(resolver.add_member(&mut group, &alice).unwrap());

        let no_add = GabConfig {
            group_members_add: false,
            ..GabConfig::default()
        };
        let mut other = saved(&store, EntityKind::Group, "other");
        let resolver = MembershipResolver::new(&store, &no_add);
        assert!(!resolver.add_member(&mut other, &alice).unwrap());
        assert!(other.members.is_empty());
    }

    #[test]
    fn test_cycles_are_rejected() {
        let store = store();
        let config = GabConfig::default();
        let resolver = MembershipResolver::new(&store, &config);

        let mut a = saved(&store, EntityKind::Group, "a");
        let mut b = saved(&store, EntityKind::Group, "b");
        let mut c = saved(&store, EntityKind::Group, "c");

        let same = a.clone();
        assert!(!resolver.add_member(&mut a, &same).unwrap());

        // a ⊃ b ⊃ c
        assert!(resolver.add_member(&mut a, &b).unwrap());
        store.save(&a).unwrap();
        assert!(resolver.add_member(&mut b, &c).unwrap());
        store.save(&b).unwrap();

        // c ⊃ a would close the loop
        assert!(!resolver.add_member(&mut c, &a).unwrap());
        assert!(c.members.is_empty());
    }

    #[test]
    fn test_nesting_depth_bounds_the_walk() {
        let store = store();
        let config = GabConfig {
            max_nesting_depth: 2,
            ..GabConfig::default()
        };
        let resolver = MembershipResolver::new(&store, &config);

        let mut top = saved(&store, EntityKind::Group, "top");
        let mut mid = saved(&store, EntityKind::Group, "mid");
        let mut low = saved(&store, EntityKind::Group, "low");
        let bottom = saved(&store, EntityKind::Group, "bottom");

        assert!(resolver.add_member(&mut low, &bottom).unwrap());
        store.save(&low).unwrap();
        assert!(resolver.add_member(&mut mid, &low).unwrap());
        store.save(&mid).unwrap();

        // top -> mid -> low -> bottom is deeper than allowed
        assert!(!resolver.add_member(&mut top, &mid).unwrap());
    }
}
