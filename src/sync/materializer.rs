//! Building local contacts and groups from directory entries
//!
//! Fields are copied only when the entry carries them, so a chunk that sends
//! a partial entry never wipes what an earlier chunk wrote.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use super::chunk_index::ChunkIndex;
use super::item_cache::ItemCache;
use super::membership::MembershipResolver;
use super::record::{DirectoryEntryRecord, EntryType, FIELD_MEMBERS, FIELD_PHOTO};
use crate::config::GabConfig;
use crate::store::{DirectoryStore, EntityKind, LocalEntity, PROP_DIRECTORY_ID, PROP_OWNER_CHUNK};
use crate::types::error::Result;

/// Display type written on rooms and equipment
pub const DISPLAY_TYPE_MAILUSER: i64 = 0;
pub const DISPLAY_TYPE_ROOM: i64 = 7;
pub const DISPLAY_TYPE_EQUIPMENT: i64 = 8;

pub const PROP_DISPLAY_TYPE: &str = "displayType";
pub const PROP_DISPLAY_TYPE_EX: &str = "displayTypeEx";
pub const PROP_DL_NAME: &str = "dlName";
pub const PROP_GROUP_SMTP: &str = "smtpAddress";

const PROP_FULL_NAME: &str = "fullName";
const PROP_FILE_AS: &str = "fileAs";
const PROP_EMAIL: &str = "email1Address";
const PROP_EMAIL_TYPE: &str = "email1AddressType";

/// Entry field → contact property, copied verbatim when present
const CONTACT_FIELDS: &[(&str, &str)] = &[
    ("givenName", "firstName"),
    ("initials", "initials"),
    ("surname", "lastName"),
    ("title", "jobTitle"),
    ("companyName", "companyName"),
    ("officeLocation", "officeLocation"),
    ("businessTelephoneNumber", "businessTelephoneNumber"),
    ("mobileTelephoneNumber", "mobileTelephoneNumber"),
    ("homeTelephoneNumber", "homeTelephoneNumber"),
    ("beeperTelephoneNumber", "pagerNumber"),
    ("organizationalIdNumber", "organizationalIdNumber"),
    ("postalAddress", "businessAddress"),
    ("businessAddressCity", "businessAddressCity"),
    ("businessAddressPostalCode", "businessAddressPostalCode"),
    ("businessAddressPostOfficeBox", "businessAddressPostOfficeBox"),
    ("businessAddressStateOrProvince", "businessAddressState"),
    ("language", "language"),
];

/// What happened to a single entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Created,
    Updated,
    Skipped,
}

pub struct EntityMaterializer<'a> {
    store: &'a dyn DirectoryStore,
    cache: &'a mut ItemCache,
    config: &'a GabConfig,
    membership: MembershipResolver<'a>,
    photo_dir: PathBuf,
}

impl<'a> EntityMaterializer<'a> {
    pub fn new(store: &'a dyn DirectoryStore, cache: &'a mut ItemCache, config: &'a GabConfig) -> Self {
        Self {
            store,
            cache,
            config,
            membership: MembershipResolver::new(store, config),
            photo_dir: std::env::temp_dir(),
        }
    }

    /// Directory for the temporary photo files handed to the store
    pub fn with_photo_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.photo_dir = dir.into();
        self
    }

    /// Create or update the contact for a contact, room or equipment entry
    pub fn materialize_contact(
        &mut self,
        record: &DirectoryEntryRecord,
        index: ChunkIndex,
    ) -> Result<Outcome> {
        if !self.config.create_contacts {
            return Ok(Outcome::Skipped);
        }

        let (mut contact, outcome) = self.find_or_create(record, EntityKind::Contact)?;

        for (field, property) in CONTACT_FIELDS {
            if let Some(value) = record.text(field) {
                contact.set(property, value);
            }
        }
        if let Some(display_name) = record.text("displayName") {
            contact.set(PROP_FULL_NAME, display_name);
            contact.set(PROP_FILE_AS, display_name);
        }
        if let Some(smtp) = record.text("smtpAddress") {
            contact.set(PROP_EMAIL, smtp);
            contact.set(PROP_EMAIL_TYPE, "SMTP");
        }
        if self.config.sync_fax_numbers {
            if let Some(fax) = record.text("primaryFaxNumber") {
                contact.set("businessFaxNumber", fax);
            }
        }

        match record.entry_type {
            EntryType::Room => set_resource_type(&mut contact, DISPLAY_TYPE_ROOM),
            EntryType::Equipment => set_resource_type(&mut contact, DISPLAY_TYPE_EQUIPMENT),
            EntryType::Contact | EntryType::Group => {}
        }

        if let Some(photo) = record.binary(FIELD_PHOTO) {
            self.attach_photo(&mut contact, &record.id, photo);
        }

        self.finish(&mut contact, record, index)?;
        Ok(outcome)
    }

    /// Create or update the local form of a group entry
    pub fn materialize_group(
        &mut self,
        record: &DirectoryEntryRecord,
        index: ChunkIndex,
    ) -> Result<Outcome> {
        if !self.config.create_groups {
            return Ok(Outcome::Skipped);
        }

        let smtp = record.text("smtpAddress").filter(|s| !s.is_empty());
        match smtp {
            Some(smtp) if self.config.smtp_groups_as_contacts => {
                self.group_as_contact(record, index, smtp)
            }
            _ => self.group_as_group(record, index, smtp),
        }
    }

    fn group_as_group(
        &mut self,
        record: &DirectoryEntryRecord,
        index: ChunkIndex,
        smtp: Option<&str>,
    ) -> Result<Outcome> {
        let (mut group, outcome) = self.find_or_create(record, EntityKind::Group)?;

        if let Some(name) = record.text("displayName") {
            group.set(PROP_DL_NAME, name);
        }
        if let Some(smtp) = smtp {
            group.set(PROP_GROUP_SMTP, smtp);
        }

        if self.config.group_members {
            for member_id in record.members() {
                let member = match self.resolve(member_id)? {
                    Some(member) => member,
                    None => {
                        debug!("Member {} of {} not mirrored yet", member_id, record.id);
                        continue;
                    }
                };
                self.membership.add_member(&mut group, &member)?;
            }
        }

        self.finish(&mut group, record, index)?;
        Ok(outcome)
    }

    fn group_as_contact(
        &mut self,
        record: &DirectoryEntryRecord,
        index: ChunkIndex,
        smtp: &str,
    ) -> Result<Outcome> {
        let (mut contact, outcome) = self.find_or_create(record, EntityKind::Contact)?;

        if let Some(name) = record.text("displayName") {
            contact.set(PROP_FULL_NAME, name);
            contact.set(PROP_FILE_AS, name);
        }
        contact.set(PROP_EMAIL, smtp);
        contact.set(PROP_EMAIL_TYPE, "SMTP");

        // No members field leaves the rendered list alone
        let members = record.list(FIELD_MEMBERS).filter(|_| self.config.group_members);
        if let Some(members) = members {
            let mut lines = Vec::new();
            for member_id in members {
                match self.resolve(member_id)? {
                    Some(member) => lines.push(member_line(&member, member_id)),
                    None => debug!("Member {} of {} not mirrored yet", member_id, record.id),
                }
            }
            contact.body = Some(lines.join("\n"));
        }

        self.finish(&mut contact, record, index)?;
        Ok(outcome)
    }

    /// Find the entity previously mirrored for the entry, or allocate a new one.
    /// An entity of the wrong kind is replaced.
    fn find_or_create(
        &mut self,
        record: &DirectoryEntryRecord,
        kind: EntityKind,
    ) -> Result<(LocalEntity, Outcome)> {
        if let Some(handle) = self.cache.find(self.store, &record.id)? {
            match self.store.load(&handle)? {
                Some(existing) if existing.kind == kind => return Ok((existing, Outcome::Updated)),
                Some(existing) => {
                    debug!(
                        "Replacing {} of {} with a {}",
                        existing.kind.as_str(),
                        record.id,
                        kind.as_str()
                    );
                    self.store.delete(&existing.handle)?;
                    self.cache.remove(&record.id);
                }
                None => self.cache.remove(&record.id),
            }
        }
        Ok((self.store.create(kind)?, Outcome::Created))
    }

    fn resolve(&mut self, id: &str) -> Result<Option<LocalEntity>> {
        match self.cache.find(self.store, id)? {
            Some(handle) => self.store.load(&handle),
            None => Ok(None),
        }
    }

    /// Stamp provenance, save, then link into the groups listed by `memberOf`
    fn finish(
        &mut self,
        entity: &mut LocalEntity,
        record: &DirectoryEntryRecord,
        index: ChunkIndex,
    ) -> Result<()> {
        entity.set(PROP_DIRECTORY_ID, record.id.as_str());
        entity.set(PROP_OWNER_CHUNK, index.to_string());
        self.store.save(entity)?;
        self.cache.insert(&record.id, entity.handle.clone());

        self.membership
            .link_member_to_groups(self.cache, entity, record)?;
        Ok(())
    }

    fn attach_photo(&self, contact: &mut LocalEntity, id: &str, photo: &[u8]) {
        let file = match TempPhoto::write(&self.photo_dir, photo) {
            Ok(file) => file,
            Err(e) => {
                warn!("Failed to write photo of {}: {}", id, e);
                return;
            }
        };
        if let Err(e) = self.store.attach_picture(contact, file.path()) {
            warn!("Failed to attach photo of {}: {}", id, e);
        }
    }
}

fn set_resource_type(contact: &mut LocalEntity, display_type_ex: i64) {
    contact.set(PROP_DISPLAY_TYPE, DISPLAY_TYPE_MAILUSER);
    contact.set(PROP_DISPLAY_TYPE_EX, display_type_ex);
}

/// One line of the member list of a group rendered as a contact
fn member_line(member: &LocalEntity, fallback: &str) -> String {
    if member.is_group() {
        let name = member.text(PROP_DL_NAME).unwrap_or(fallback);
        return match member.text(PROP_GROUP_SMTP) {
            Some(smtp) => format!("{} ({})", name, smtp),
            None => name.to_string(),
        };
    }

    let name = member.text(PROP_FULL_NAME).unwrap_or(fallback);
    match member.text(PROP_EMAIL) {
        Some(email) => format!("{} ({})", name, email),
        None => name.to_string(),
    }
}

/// Photo written to a temporary file for the store to pick up. The file is
/// removed when the guard drops.
struct TempPhoto {
    path: PathBuf,
}

impl TempPhoto {
    fn write(dir: &Path, data: &[u8]) -> std::io::Result<Self> {
        let path = dir.join(format!("gab-photo-{}.jpg", Uuid::new_v4()));
        fs::write(&path, data)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempPhoto {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            debug!("Failed to remove temporary photo {:?}: {}", self.path, e);
        }
    }
}
