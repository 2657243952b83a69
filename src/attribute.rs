//! Attribute directories (spec §4.H): name → `{offset, length, type_id,
//! description}` tables. One instance each for named, unique, and
//! anonymous objects.
//!
//! Grounded on `v0/kernel/named_object_directory.hpp`'s
//! `unordered_map<string, pair<offset, length>>` plus its text
//! serialization (`"name offset length\n"`), extended with the
//! `type_id`/`description` fields the on-disk layout in spec §6 adds,
//! and on `utility/datastore_ls.hpp`'s offline accessor pattern
//! (iterate a directory's entries without mapping the segment).
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};

/// Names of the three attribute directory files under a datastore's
/// `metadata/` subdirectory (spec §6 on-disk layout), kept here so
/// [`Accessor`] can read them independently of [`crate::manager`].
const METADATA_DIR: &str = "metadata";
const NAMED_FILE: &str = "named_object_directory";
const UNIQUE_FILE: &str = "unique_object_directory";
const ANONYMOUS_FILE: &str = "anonymous_object_directory";

/// Offline accessor (spec §4.H, grounding `utility/datastore_ls.hpp`):
/// reads a datastore's attribute directories straight off disk, with
/// no `mmap` of the segment and no live [`crate::manager::Manager`].
/// This is the capability the (out-of-scope) `datastore_ls` CLI would
/// be built on top of.
pub struct Accessor;

impl Accessor {
    fn read(root: &Path, keying: Keying, file: &str) -> Result<AttributeDirectory> {
        let path = root.join(METADATA_DIR).join(file);
        let text = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        AttributeDirectory::deserialize(keying, &text)
    }

    /// Reads the named-object directory of the datastore at `root`.
    pub fn named(root: &Path) -> Result<AttributeDirectory> {
        Self::read(root, Keying::Named, NAMED_FILE)
    }

    /// Reads the unique-object directory of the datastore at `root`.
    pub fn unique(root: &Path) -> Result<AttributeDirectory> {
        Self::read(root, Keying::Named, UNIQUE_FILE)
    }

    /// Reads the anonymous-object directory of the datastore at `root`.
    pub fn anonymous(root: &Path) -> Result<AttributeDirectory> {
        Self::read(root, Keying::Anonymous, ANONYMOUS_FILE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: Option<String>,
    pub offset: usize,
    pub length: usize,
    pub type_id: String,
    pub description: String,
}

/// Whether entries in this directory carry a name (used both to
/// enforce uniqueness and to pick the on-disk schema: named/unique
/// directories write the name column, the anonymous directory omits
/// it, per spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keying {
    Named,
    Anonymous,
}

pub struct AttributeDirectory {
    keying: Keying,
    entries: Vec<Entry>,
    by_name: HashMap<String, usize>,
}

impl AttributeDirectory {
    pub fn new(keying: Keying) -> Self {
        Self {
            keying,
            entries: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Inserts a named entry. Fails with [`Error::Duplicate`] if the
    /// name is already present. Panics if called on an anonymous
    /// directory — use [`insert_anonymous`](Self::insert_anonymous).
    pub fn insert(
        &mut self,
        name: &str,
        offset: usize,
        length: usize,
        type_id: &str,
    ) -> Result<()> {
        assert_eq!(self.keying, Keying::Named);
        if self.by_name.contains_key(name) {
            return Err(Error::Duplicate(name.to_string()));
        }
        let index = self.entries.len();
        self.entries.push(Entry {
            name: Some(name.to_string()),
            offset,
            length,
            type_id: type_id.to_string(),
            description: String::new(),
        });
        self.by_name.insert(name.to_string(), index);
        Ok(())
    }

    /// Inserts an entry with no name key, returning its offset (the
    /// only handle anonymous entries can be found by again).
    pub fn insert_anonymous(&mut self, offset: usize, length: usize, type_id: &str) {
        assert_eq!(self.keying, Keying::Anonymous);
        self.entries.push(Entry {
            name: None,
            offset,
            length,
            type_id: type_id.to_string(),
            description: String::new(),
        });
    }

    pub fn find(&self, name: &str) -> Option<&Entry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    /// Removes and returns the named entry.
    pub fn erase(&mut self, name: &str) -> Result<Entry> {
        let index = self
            .by_name
            .remove(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let removed = self.entries.remove(index);
        self.reindex_from(index);
        Ok(removed)
    }

    /// Removes and returns the entry at `offset` (the only way to
    /// address an anonymous entry for destruction).
    pub fn erase_by_offset(&mut self, offset: usize) -> Option<Entry> {
        let index = self.entries.iter().position(|e| e.offset == offset)?;
        let removed = self.entries.remove(index);
        self.reindex_from(index);
        Some(removed)
    }

    fn reindex_from(&mut self, _from: usize) {
        if self.keying == Keying::Anonymous {
            return;
        }
        // Removing an entry shifts every later index down by one;
        // rebuild the whole name->index map rather than patching it,
        // since erase is rare relative to find.
        self.by_name.clear();
        for (i, entry) in self.entries.iter().enumerate() {
            if let Some(name) = &entry.name {
                self.by_name.insert(name.clone(), i);
            }
        }
    }

    pub fn set_description(&mut self, name: &str, text: &str) -> Result<()> {
        let index = *self
            .by_name
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        self.entries[index].description = text.to_string();
        Ok(())
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes one whitespace-separated line per entry. Named/unique
    /// directories write `<name> <offset> <length> <type_id> <desc>`;
    /// the anonymous directory omits the name column.
    pub fn serialize(&self, out: &mut impl Write) -> std::io::Result<()> {
        for entry in &self.entries {
            let desc = if entry.description.is_empty() {
                "-"
            } else {
                &entry.description
            };
            match &entry.name {
                Some(name) => writeln!(
                    out,
                    "{name} {} {} {} {desc}",
                    entry.offset, entry.length, entry.type_id
                )?,
                None => writeln!(out, "{} {} {} {desc}", entry.offset, entry.length, entry.type_id)?,
            }
        }
        Ok(())
    }

    pub fn deserialize(keying: Keying, text: &str) -> Result<Self> {
        let mut directory = Self::new(keying);
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let bad = || Error::InvalidArgument("malformed attribute directory line");

            match keying {
                Keying::Named => {
                    if fields.len() < 4 {
                        return Err(bad());
                    }
                    let name = fields[0];
                    let offset: usize = fields[1].parse().map_err(|_| bad())?;
                    let length: usize = fields[2].parse().map_err(|_| bad())?;
                    let type_id = fields[3];
                    let desc = fields[4..].join(" ");
                    directory.insert(name, offset, length, type_id)?;
                    if desc != "-" && !desc.is_empty() {
                        directory.set_description(name, &desc)?;
                    }
                }
                Keying::Anonymous => {
                    if fields.len() < 3 {
                        return Err(bad());
                    }
                    let offset: usize = fields[0].parse().map_err(|_| bad())?;
                    let length: usize = fields[1].parse().map_err(|_| bad())?;
                    let type_id = fields[2];
                    let desc = fields[3..].join(" ");
                    directory.insert_anonymous(offset, length, type_id);
                    if desc != "-" && !desc.is_empty() {
                        if let Some(entry) = directory.entries.last_mut() {
                            entry.description = desc;
                        }
                    }
                }
            }
        }
        Ok(directory)
    }
}
