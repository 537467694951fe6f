//! Organizer engine: a nested workspace tree (spaces, groups, leaf collections, work items)
//! and a numbered stage pipeline, plus the drag-session, snapshot, autosave and projection
//! layers that sit around them. Keep the documents pure; side effects live in `storage`,
//! `autosave` and the binary.

pub mod core {
    use crate::ordered::OrderedContainer;
    use chrono::{DateTime, Utc};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use serde_with::skip_serializing_none;
    use std::{fmt, hash::Hash, str::FromStr};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    /// Identity type stored in an ordered container or lookup table.
    pub trait EntityId: Copy + Eq + Hash + fmt::Debug + fmt::Display {
        const KIND: EntityKind;
    }

    macro_rules! entity_id {
        ($name:ident, $kind:expr) => {
            #[derive(
                Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
            )]
            #[serde(transparent)]
            pub struct $name(pub Uuid);

            impl $name {
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    self.0.fmt(f)
                }
            }

            impl FromStr for $name {
                type Err = uuid::Error;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    Uuid::parse_str(s).map(Self)
                }
            }

            impl EntityId for $name {
                const KIND: EntityKind = $kind;
            }
        };
    }

    entity_id!(SpaceId, EntityKind::Space);
    entity_id!(GroupId, EntityKind::Group);
    entity_id!(CollectionId, EntityKind::Collection);
    entity_id!(WorkItemId, EntityKind::WorkItem);
    entity_id!(CardId, EntityKind::Card);
    entity_id!(SubtaskId, EntityKind::Subtask);

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum EntityKind {
        Space,
        Group,
        Collection,
        WorkItem,
        Card,
        Subtask,
        Stage,
    }

    impl fmt::Display for EntityKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(match self {
                EntityKind::Space => "space",
                EntityKind::Group => "group",
                EntityKind::Collection => "collection",
                EntityKind::WorkItem => "work item",
                EntityKind::Card => "card",
                EntityKind::Subtask => "subtask",
                EntityKind::Stage => "stage",
            })
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    /// Every failure the organizer reports. All of them are recoverable: the documents are
    /// never left half-mutated.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum OrganizerError {
        #[error("{kind} {id} not found")]
        NotFound { kind: EntityKind, id: String },
        #[error("invalid drop target: {0}")]
        InvalidTarget(String),
        #[error("cannot delete the last remaining stage")]
        CannotDeleteLastStage,
        #[error("snapshot is corrupt: {0}")]
        CorruptSnapshot(String),
        #[error("failed to persist {key}: {reason}")]
        PersistenceWriteFailed { key: String, reason: String },
        #[error("confirmation rejected")]
        Unauthorized,
        #[error("{id} is already present in the container")]
        DuplicateEntry { id: String },
        #[error("invalid input: {0}")]
        InvalidInput(String),
    }

    impl OrganizerError {
        pub fn not_found<I: EntityId>(id: I) -> Self {
            Self::NotFound {
                kind: I::KIND,
                id: id.to_string(),
            }
        }

        pub fn stage_not_found(number: u32) -> Self {
            Self::NotFound {
                kind: EntityKind::Stage,
                id: number.to_string(),
            }
        }

        pub fn is_recoverable(&self) -> bool {
            true
        }

        /// Short, user-facing text for the transient notice shown by the presentation layer.
        pub fn notice(&self) -> String {
            match self {
                OrganizerError::NotFound { kind, .. } => {
                    format!("That {kind} no longer exists; nothing was changed.")
                }
                OrganizerError::InvalidTarget(_) => "That can't be dropped there.".to_string(),
                OrganizerError::CannotDeleteLastStage => {
                    "A pipeline needs at least one stage.".to_string()
                }
                OrganizerError::CorruptSnapshot(_) => {
                    "Saved data could not be read; starting from a fresh board.".to_string()
                }
                OrganizerError::PersistenceWriteFailed { .. } => {
                    "Changes could not be saved right now; saving will be retried."
                        .to_string()
                }
                OrganizerError::Unauthorized => {
                    "Confirmation rejected; nothing was changed.".to_string()
                }
                OrganizerError::DuplicateEntry { .. } => {
                    "That entry is already in place.".to_string()
                }
                OrganizerError::InvalidInput(msg) => msg.clone(),
            }
        }
    }

    pub type OrganizerResult<T> = Result<T, OrganizerError>;

    /// Reject blank names; returns the trimmed text.
    pub(crate) fn non_empty(label: &str, value: &str) -> OrganizerResult<String> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(OrganizerError::InvalidInput(format!("{label} must not be empty")));
        }
        Ok(trimmed.to_string())
    }

    /// Result of a move request. `Unchanged` means the request was a no-op and nothing was
    /// touched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MoveOutcome {
        Moved,
        Unchanged,
    }

    /* ---------------------------- Value Objects ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Priority {
        Low,
        Normal,
        High,
        Urgent,
    }

    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
    )]
    #[serde(rename_all = "snake_case")]
    pub enum Status {
        #[default]
        Todo,
        InProgress,
        Blocked,
        Done,
    }

    /// Optional metadata carried by work items.
    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ItemMeta {
        pub priority: Option<Priority>,
        pub assignee: Option<String>,
        pub created_at: Option<DateTime<Utc>>,
        pub updated_at: Option<DateTime<Utc>>,
    }

    /// Color/icon tag rendered next to a space.
    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct SpaceTag {
        pub color: String,
        pub icon: Option<String>,
    }

    impl Default for SpaceTag {
        fn default() -> Self {
            Self {
                color: "slate".to_string(),
                icon: None,
            }
        }
    }

    /* ------------------------------- Subtasks ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Subtask {
        pub id: SubtaskId,
        pub title: String,
        #[serde(default)]
        pub completed: bool,
        /// Zero-based and dense; always equal to the subtask's position in its list.
        #[serde(default)]
        pub order: u32,
    }

    /// Ordered subtasks of a work item or card. Every operation leaves `order` dense.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct SubtaskList {
        entries: Vec<Subtask>,
    }

    /// Completed/total counts for a subtask list.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
    pub struct Progress {
        pub done: usize,
        pub total: usize,
    }

    impl SubtaskList {
        pub fn iter(&self) -> impl Iterator<Item = &Subtask> {
            self.entries.iter()
        }

        pub fn len(&self) -> usize {
            self.entries.len()
        }

        pub fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }

        pub fn get(&self, id: SubtaskId) -> Option<&Subtask> {
            self.entries.iter().find(|s| s.id == id)
        }

        pub fn add(&mut self, title: &str) -> OrganizerResult<SubtaskId> {
            let title = non_empty("subtask title", title)?;
            let id = SubtaskId::new();
            self.entries.push(Subtask {
                id,
                title,
                completed: false,
                order: 0,
            });
            self.renumber();
            Ok(id)
        }

        /// Flip the completed flag; returns the new value.
        pub fn toggle(&mut self, id: SubtaskId) -> OrganizerResult<bool> {
            let entry = self.find_mut(id)?;
            entry.completed = !entry.completed;
            Ok(entry.completed)
        }

        pub fn rename(&mut self, id: SubtaskId, title: &str) -> OrganizerResult<()> {
            let title = non_empty("subtask title", title)?;
            self.find_mut(id)?.title = title;
            Ok(())
        }

        pub fn remove(&mut self, id: SubtaskId) -> OrganizerResult<Subtask> {
            let pos = self.position(id)?;
            let removed = self.entries.remove(pos);
            self.renumber();
            Ok(removed)
        }

        /// Move a subtask to `index` (clamped to the list bounds).
        pub fn move_to(&mut self, id: SubtaskId, index: usize) -> OrganizerResult<MoveOutcome> {
            let pos = self.position(id)?;
            let target = index.min(self.entries.len() - 1);
            if target == pos {
                return Ok(MoveOutcome::Unchanged);
            }
            let entry = self.entries.remove(pos);
            self.entries.insert(target, entry);
            self.renumber();
            Ok(MoveOutcome::Moved)
        }

        pub fn progress(&self) -> Progress {
            Progress {
                done: self.entries.iter().filter(|s| s.completed).count(),
                total: self.entries.len(),
            }
        }

        /// Restore dense ordering after decoding records that predate or mangle `order`.
        pub(crate) fn normalize(&mut self) {
            self.entries.sort_by_key(|s| s.order);
            self.renumber();
        }

        pub(crate) fn check_dense(&self) -> OrganizerResult<()> {
            let mut seen = std::collections::HashSet::new();
            for (pos, s) in self.entries.iter().enumerate() {
                if s.order as usize != pos {
                    return Err(OrganizerError::CorruptSnapshot(format!(
                        "subtask {} has order {} at position {pos}",
                        s.id, s.order
                    )));
                }
                if !seen.insert(s.id) {
                    return Err(OrganizerError::DuplicateEntry {
                        id: s.id.to_string(),
                    });
                }
            }
            Ok(())
        }

        fn position(&self, id: SubtaskId) -> OrganizerResult<usize> {
            self.entries
                .iter()
                .position(|s| s.id == id)
                .ok_or_else(|| OrganizerError::not_found(id))
        }

        fn find_mut(&mut self, id: SubtaskId) -> OrganizerResult<&mut Subtask> {
            self.entries
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| OrganizerError::not_found(id))
        }

        fn renumber(&mut self) {
            for (pos, s) in self.entries.iter_mut().enumerate() {
                s.order = pos as u32;
            }
        }
    }

    /* ------------------------------ Tree entities ------------------------------ */

    /// Leaf task. Owned by exactly one leaf collection; ownership lives in the collection's
    /// id list, not on the item.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct WorkItem {
        pub id: WorkItemId,
        pub title: String,
        #[serde(default)]
        pub description: Option<String>,
        #[serde(default)]
        pub status: Status,
        #[serde(default)]
        pub subtasks: SubtaskList,
        #[serde(default)]
        pub meta: ItemMeta,
    }

    impl WorkItem {
        pub fn new(title: String, now: DateTime<Utc>) -> Self {
            Self {
                id: WorkItemId::new(),
                title,
                description: None,
                status: Status::default(),
                subtasks: SubtaskList::default(),
                meta: ItemMeta {
                    created_at: Some(now),
                    updated_at: Some(now),
                    ..ItemMeta::default()
                },
            }
        }
    }

    /// A "project"/list: an ordered container of work items.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LeafCollection {
        pub id: CollectionId,
        pub name: String,
        #[serde(default)]
        pub items: OrderedContainer<WorkItemId>,
    }

    /// A "folder" of leaf collections inside a space.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Group {
        pub id: GroupId,
        pub name: String,
        #[serde(default)]
        pub open: bool,
        #[serde(default)]
        pub collections: OrderedContainer<CollectionId>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Space {
        pub id: SpaceId,
        pub name: String,
        #[serde(default)]
        pub tag: SpaceTag,
        #[serde(default)]
        pub open: bool,
        #[serde(default)]
        pub groups: OrderedContainer<GroupId>,
        /// Leaf collections held directly by the space (not inside a group).
        #[serde(default)]
        pub collections: OrderedContainer<CollectionId>,
    }

    /* ---------------------------- Pipeline entities ---------------------------- */

    /// A numbered pipeline step. `number` is the stage's identity and is always its
    /// one-based position.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Stage {
        pub number: u32,
        pub title: String,
        #[serde(default)]
        pub short_title: String,
        #[serde(default)]
        pub instructions: String,
    }

    /// Pipeline work item (a card on the board). Stage membership is the `stage` reference.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Card {
        pub id: CardId,
        pub name: String,
        /// Free-text fields keyed by label (client, domain, notes, ...).
        #[serde(default)]
        pub fields: IndexMap<String, String>,
        pub stage: u32,
        pub created_at: DateTime<Utc>,
        #[serde(default)]
        pub archived: bool,
        #[serde(default)]
        pub subtasks: SubtaskList,
    }

}

pub mod ordered {
    //! Dense, duplicate-free ordered list of entity ids.
    //!
    //! Positions are zero-based and contiguous. Inserting shifts later entries up by one,
    //! removing shifts them down by one. Every operation either completes or leaves the list
    //! untouched.

    use crate::core::{EntityId, OrganizerError, OrganizerResult};
    use serde::{Deserialize, Serialize};
    use std::collections::HashSet;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct OrderedContainer<T> {
        entries: Vec<T>,
    }

    impl<T> Default for OrderedContainer<T> {
        fn default() -> Self {
            Self {
                entries: Vec::new(),
            }
        }
    }

    impl<T: EntityId> OrderedContainer<T> {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn len(&self) -> usize {
            self.entries.len()
        }

        pub fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }

        pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
            self.entries.iter().copied()
        }

        pub fn as_slice(&self) -> &[T] {
            &self.entries
        }

        pub fn contains(&self, id: T) -> bool {
            self.entries.contains(&id)
        }

        pub fn position(&self, id: T) -> Option<usize> {
            self.entries.iter().position(|e| *e == id)
        }

        /// Insert `id` at `index` clamped into `[0, len]`; returns the index used.
        pub fn insert_at(&mut self, index: usize, id: T) -> OrganizerResult<usize> {
            if self.contains(id) {
                return Err(OrganizerError::DuplicateEntry { id: id.to_string() });
            }
            let index = index.min(self.entries.len());
            self.entries.insert(index, id);
            Ok(index)
        }

        pub fn push(&mut self, id: T) -> OrganizerResult<usize> {
            self.insert_at(usize::MAX, id)
        }

        /// Remove `id`; returns the position it held.
        pub fn remove_by_id(&mut self, id: T) -> OrganizerResult<usize> {
            match self.position(id) {
                Some(pos) => {
                    self.entries.remove(pos);
                    Ok(pos)
                }
                None => {
                    tracing::warn!(%id, kind = %T::KIND, "remove from container: id not present");
                    Err(OrganizerError::not_found(id))
                }
            }
        }

        /// Where `id` would land if moved to `index` (clamped into `[0, len - 1]`).
        pub fn effective_index(&self, index: usize) -> usize {
            index.min(self.entries.len().saturating_sub(1))
        }

        /// Reorder `id` to `new_index` (clamped); the remove and insert happen under one
        /// `&mut` borrow, so no intermediate state is observable.
        pub fn move_within(&mut self, id: T, new_index: usize) -> OrganizerResult<usize> {
            let pos = self
                .position(id)
                .ok_or_else(|| OrganizerError::not_found(id))?;
            let target = self.effective_index(new_index);
            if target != pos {
                let entry = self.entries.remove(pos);
                self.entries.insert(target, entry);
            }
            Ok(target)
        }

        /// First id that appears more than once, if any.
        pub fn first_duplicate(&self) -> Option<T> {
            let mut seen = HashSet::with_capacity(self.entries.len());
            self.entries.iter().copied().find(|id| !seen.insert(*id))
        }
    }

}

pub mod tree {
    //! Nested workspace tree: spaces → groups → leaf collections → work items.
    //!
    //! Entities live in id-indexed tables. Ownership is "which container's id list holds this
    //! id"; nothing carries a parent pointer. Every mutation validates before it touches a
    //! list, so a failed call leaves the tree as it was.

    use crate::core::*;
    use crate::ordered::OrderedContainer;
    use chrono::{DateTime, Utc};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use tracing::debug;

    /* ----------------------------- Locators ----------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum ContainerKind {
        Groups,
        Collections,
        Items,
    }

    /// Addressable path to one container in the tree.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Locator {
        /// Groups held by a space.
        SpaceGroups { space: SpaceId },
        /// Leaf collections held directly by a space.
        SpaceCollections { space: SpaceId },
        /// Leaf collections inside a group.
        GroupCollections { space: SpaceId, group: GroupId },
        /// Work items inside a leaf collection.
        CollectionItems {
            space: SpaceId,
            group: Option<GroupId>,
            collection: CollectionId,
        },
    }

    impl Locator {
        pub fn kind(&self) -> ContainerKind {
            match self {
                Locator::SpaceGroups { .. } => ContainerKind::Groups,
                Locator::SpaceCollections { .. } | Locator::GroupCollections { .. } => {
                    ContainerKind::Collections
                }
                Locator::CollectionItems { .. } => ContainerKind::Items,
            }
        }

        pub fn space(&self) -> SpaceId {
            match *self {
                Locator::SpaceGroups { space }
                | Locator::SpaceCollections { space }
                | Locator::GroupCollections { space, .. }
                | Locator::CollectionItems { space, .. } => space,
            }
        }
    }

    /// A movable tree node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Node {
        WorkItem(WorkItemId),
        Collection(CollectionId),
        Group(GroupId),
    }

    impl Node {
        /// The only container kind this node may live in.
        pub fn container_kind(&self) -> ContainerKind {
            match self {
                Node::WorkItem(_) => ContainerKind::Items,
                Node::Collection(_) => ContainerKind::Collections,
                Node::Group(_) => ContainerKind::Groups,
            }
        }

        fn not_found(&self) -> OrganizerError {
            match *self {
                Node::WorkItem(id) => OrganizerError::not_found(id),
                Node::Collection(id) => OrganizerError::not_found(id),
                Node::Group(id) => OrganizerError::not_found(id),
            }
        }
    }

    /// Read-only view of one container's id list.
    #[derive(Debug, Clone, Copy)]
    pub enum ContainerRef<'a> {
        Groups(&'a OrderedContainer<GroupId>),
        Collections(&'a OrderedContainer<CollectionId>),
        Items(&'a OrderedContainer<WorkItemId>),
    }

    impl ContainerRef<'_> {
        pub fn len(&self) -> usize {
            match self {
                ContainerRef::Groups(c) => c.len(),
                ContainerRef::Collections(c) => c.len(),
                ContainerRef::Items(c) => c.len(),
            }
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        pub fn position(&self, node: Node) -> Option<usize> {
            match (self, node) {
                (ContainerRef::Groups(c), Node::Group(id)) => c.position(id),
                (ContainerRef::Collections(c), Node::Collection(id)) => c.position(id),
                (ContainerRef::Items(c), Node::WorkItem(id)) => c.position(id),
                _ => None,
            }
        }

        pub fn nodes(&self) -> Vec<Node> {
            match self {
                ContainerRef::Groups(c) => c.iter().map(Node::Group).collect(),
                ContainerRef::Collections(c) => c.iter().map(Node::Collection).collect(),
                ContainerRef::Items(c) => c.iter().map(Node::WorkItem).collect(),
            }
        }

        fn effective_index(&self, index: usize) -> usize {
            index.min(self.len().saturating_sub(1))
        }
    }

    /* ------------------------------ Edits ------------------------------ */

    /// Field updates for a work item; `None` leaves a field as it is.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct WorkItemPatch {
        pub title: Option<String>,
        pub description: Option<Option<String>>,
        pub status: Option<Status>,
        pub priority: Option<Option<Priority>>,
        pub assignee: Option<Option<String>>,
    }

    /// What a cascading delete removed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Deletion {
        pub groups: usize,
        pub collections: usize,
        pub items: usize,
    }

    /* ------------------------------ Aggregate ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct WorkspaceTree {
        /// Top-level ordering of spaces.
        #[serde(default)]
        order: OrderedContainer<SpaceId>,
        #[serde(default)]
        spaces: IndexMap<SpaceId, Space>,
        #[serde(default)]
        groups: IndexMap<GroupId, Group>,
        #[serde(default)]
        collections: IndexMap<CollectionId, LeafCollection>,
        #[serde(default)]
        items: IndexMap<WorkItemId, WorkItem>,
    }

    impl WorkspaceTree {
        pub fn new() -> Self {
            Self::default()
        }

        /* ------------------------------ Reads ------------------------------ */

        /// Spaces in display order.
        pub fn spaces(&self) -> impl Iterator<Item = &Space> {
            self.order.iter().filter_map(|id| self.spaces.get(&id))
        }

        pub fn space(&self, id: SpaceId) -> OrganizerResult<&Space> {
            self.spaces
                .get(&id)
                .ok_or_else(|| OrganizerError::not_found(id))
        }

        pub fn group(&self, id: GroupId) -> OrganizerResult<&Group> {
            self.groups
                .get(&id)
                .ok_or_else(|| OrganizerError::not_found(id))
        }

        pub fn collection(&self, id: CollectionId) -> OrganizerResult<&LeafCollection> {
            self.collections
                .get(&id)
                .ok_or_else(|| OrganizerError::not_found(id))
        }

        pub fn item(&self, id: WorkItemId) -> OrganizerResult<&WorkItem> {
            self.items
                .get(&id)
                .ok_or_else(|| OrganizerError::not_found(id))
        }

        pub fn item_count(&self) -> usize {
            self.items.len()
        }

        pub fn collection_count(&self) -> usize {
            self.collections.len()
        }

        pub fn group_count(&self) -> usize {
            self.groups.len()
        }

        /// Resolve a locator to its container, checking that the path is consistent.
        pub fn container(&self, loc: &Locator) -> OrganizerResult<ContainerRef<'_>> {
            self.validate_locator(loc)?;
            Ok(match *loc {
                Locator::SpaceGroups { space } => ContainerRef::Groups(&self.space(space)?.groups),
                Locator::SpaceCollections { space } => {
                    ContainerRef::Collections(&self.space(space)?.collections)
                }
                Locator::GroupCollections { group, .. } => {
                    ContainerRef::Collections(&self.group(group)?.collections)
                }
                Locator::CollectionItems { collection, .. } => {
                    ContainerRef::Items(&self.collection(collection)?.items)
                }
            })
        }

        /// Current container and position of `node`.
        pub fn locate(&self, node: Node) -> OrganizerResult<(Locator, usize)> {
            let found = match node {
                Node::Group(id) => self.spaces().find_map(|s| {
                    s.groups
                        .position(id)
                        .map(|pos| (Locator::SpaceGroups { space: s.id }, pos))
                }),
                Node::Collection(id) => self.collection_owner(id),
                Node::WorkItem(id) => self.collections.values().find_map(|c| {
                    let pos = c.items.position(id)?;
                    let loc = self.items_locator(c.id)?;
                    Some((loc, pos))
                }),
            };
            found.ok_or_else(|| node.not_found())
        }

        /// Locator of the work-item list inside collection `id`.
        pub fn items_locator(&self, id: CollectionId) -> Option<Locator> {
            let (owner, _) = self.collection_owner(id)?;
            Some(match owner {
                Locator::GroupCollections { space, group } => Locator::CollectionItems {
                    space,
                    group: Some(group),
                    collection: id,
                },
                other => Locator::CollectionItems {
                    space: other.space(),
                    group: None,
                    collection: id,
                },
            })
        }

        /// Whether moving `node` from `from` to `to` at `at_index` would change anything.
        /// Pure; shared by the drag layer's pre-commit check and `move_node`.
        pub fn would_move(
            &self,
            node: Node,
            from: &Locator,
            to: &Locator,
            at_index: usize,
        ) -> OrganizerResult<bool> {
            let current = self.position_in(from, node)?;
            if from != to {
                return Ok(true);
            }
            let container = self.container(to)?;
            Ok(container.effective_index(at_index) != current)
        }

        /* ----------------------------- Moving ----------------------------- */

        /// Move `node` out of `from` and into `to` at `at_index` (clamped). Same-container
        /// reorders, cross-group and cross-space moves all take this path. The destination's
        /// space and group are opened so the moved node is visible.
        pub fn move_node(
            &mut self,
            node: Node,
            from: &Locator,
            to: &Locator,
            at_index: usize,
        ) -> OrganizerResult<MoveOutcome> {
            let kind = node.container_kind();
            if to.kind() != kind || from.kind() != kind {
                return Err(OrganizerError::InvalidTarget(format!(
                    "{node:?} cannot be placed in a {:?} container",
                    to.kind()
                )));
            }
            self.validate_locator(to)?;
            if !self.would_move(node, from, to, at_index)? {
                debug!(?node, "move is a no-op; skipped");
                return Ok(MoveOutcome::Unchanged);
            }

            let placed = match node {
                Node::Group(id) => {
                    self.groups_at_mut(from)?.remove_by_id(id)?;
                    self.groups_at_mut(to)?.insert_at(at_index, id)?
                }
                Node::Collection(id) => {
                    self.collections_at_mut(from)?.remove_by_id(id)?;
                    self.collections_at_mut(to)?.insert_at(at_index, id)?
                }
                Node::WorkItem(id) => {
                    self.items_at_mut(from)?.remove_by_id(id)?;
                    self.items_at_mut(to)?.insert_at(at_index, id)?
                }
            };
            self.reveal(to);
            debug!(?node, from = %from, to = %to, index = placed, "moved node");
            Ok(MoveOutcome::Moved)
        }

        /* ---------------------------- Creation ---------------------------- */

        pub fn create_space(&mut self, name: &str, tag: SpaceTag) -> OrganizerResult<SpaceId> {
            let space = Space {
                id: SpaceId::new(),
                name: non_empty("space name", name)?,
                tag,
                open: true,
                groups: OrderedContainer::new(),
                collections: OrderedContainer::new(),
            };
            let id = space.id;
            self.order.push(id)?;
            self.spaces.insert(id, space);
            debug!(%id, "created space");
            Ok(id)
        }

        pub fn create_group(
            &mut self,
            space: SpaceId,
            name: &str,
            index: Option<usize>,
        ) -> OrganizerResult<GroupId> {
            let name = non_empty("group name", name)?;
            let group = Group {
                id: GroupId::new(),
                name,
                open: true,
                collections: OrderedContainer::new(),
            };
            let id = group.id;
            self.groups_at_mut(&Locator::SpaceGroups { space })?
                .insert_at(index.unwrap_or(usize::MAX), id)?;
            self.groups.insert(id, group);
            debug!(%id, %space, "created group");
            Ok(id)
        }

        /// Create a leaf collection in a space root or a group.
        pub fn create_collection(
            &mut self,
            at: &Locator,
            name: &str,
            index: Option<usize>,
        ) -> OrganizerResult<CollectionId> {
            let name = non_empty("collection name", name)?;
            self.validate_locator(at)?;
            let collection = LeafCollection {
                id: CollectionId::new(),
                name,
                items: OrderedContainer::new(),
            };
            let id = collection.id;
            self.collections_at_mut(at)?
                .insert_at(index.unwrap_or(usize::MAX), id)?;
            self.collections.insert(id, collection);
            debug!(%id, at = %at, "created collection");
            Ok(id)
        }

        pub fn create_item(
            &mut self,
            at: &Locator,
            title: &str,
            now: DateTime<Utc>,
            index: Option<usize>,
        ) -> OrganizerResult<WorkItemId> {
            let title = non_empty("work item title", title)?;
            self.validate_locator(at)?;
            let item = WorkItem::new(title, now);
            let id = item.id;
            self.items_at_mut(at)?
                .insert_at(index.unwrap_or(usize::MAX), id)?;
            self.items.insert(id, item);
            debug!(%id, at = %at, "created work item");
            Ok(id)
        }

        /* ----------------------------- Editing ----------------------------- */

        pub fn rename_space(&mut self, id: SpaceId, name: &str) -> OrganizerResult<()> {
            let name = non_empty("space name", name)?;
            self.space_mut(id)?.name = name;
            Ok(())
        }

        pub fn set_space_tag(&mut self, id: SpaceId, tag: SpaceTag) -> OrganizerResult<()> {
            self.space_mut(id)?.tag = tag;
            Ok(())
        }

        pub fn rename_group(&mut self, id: GroupId, name: &str) -> OrganizerResult<()> {
            let name = non_empty("group name", name)?;
            self.group_mut(id)?.name = name;
            Ok(())
        }

        pub fn rename_collection(&mut self, id: CollectionId, name: &str) -> OrganizerResult<()> {
            let name = non_empty("collection name", name)?;
            self.collection_mut(id)?.name = name;
            Ok(())
        }

        pub fn update_item(
            &mut self,
            id: WorkItemId,
            patch: WorkItemPatch,
            now: DateTime<Utc>,
        ) -> OrganizerResult<()> {
            let title = patch
                .title
                .as_deref()
                .map(|t| non_empty("work item title", t))
                .transpose()?;
            let item = self.item_mut(id)?;
            if let Some(title) = title {
                item.title = title;
            }
            if let Some(description) = patch.description {
                item.description = description.filter(|d| !d.trim().is_empty());
            }
            if let Some(status) = patch.status {
                item.status = status;
            }
            if let Some(priority) = patch.priority {
                item.meta.priority = priority;
            }
            if let Some(assignee) = patch.assignee {
                item.meta.assignee = assignee;
            }
            item.meta.updated_at = Some(now);
            Ok(())
        }

        /// Run a subtask edit on one work item; bumps `updated_at` when it succeeds.
        pub fn edit_subtasks<T>(
            &mut self,
            id: WorkItemId,
            now: DateTime<Utc>,
            f: impl FnOnce(&mut SubtaskList) -> OrganizerResult<T>,
        ) -> OrganizerResult<T> {
            let item = self.item_mut(id)?;
            let out = f(&mut item.subtasks)?;
            item.meta.updated_at = Some(now);
            Ok(out)
        }

        /// Presentation-only flag; ownership is untouched. Returns the new value.
        pub fn toggle_space(&mut self, id: SpaceId) -> OrganizerResult<bool> {
            let space = self.space_mut(id)?;
            space.open = !space.open;
            Ok(space.open)
        }

        /// Presentation-only flag; ownership is untouched. Returns the new value.
        pub fn toggle_group(&mut self, id: GroupId) -> OrganizerResult<bool> {
            let group = self.group_mut(id)?;
            group.open = !group.open;
            Ok(group.open)
        }

        /* ---------------------------- Deletion ---------------------------- */

        pub fn delete_item(&mut self, id: WorkItemId) -> OrganizerResult<WorkItem> {
            let (loc, _) = self.locate(Node::WorkItem(id))?;
            self.items_at_mut(&loc)?.remove_by_id(id)?;
            let item = self
                .items
                .shift_remove(&id)
                .ok_or_else(|| OrganizerError::not_found(id))?;
            debug!(%id, "deleted work item");
            Ok(item)
        }

        /// Delete a collection and every work item in it.
        pub fn delete_collection(&mut self, id: CollectionId) -> OrganizerResult<Deletion> {
            let (loc, _) = self.locate(Node::Collection(id))?;
            self.collections_at_mut(&loc)?.remove_by_id(id)?;
            let mut removed = Deletion::default();
            self.drop_collection(id, &mut removed);
            debug!(%id, items = removed.items, "deleted collection");
            Ok(removed)
        }

        /// Delete a group with its collections and their work items.
        pub fn delete_group(&mut self, id: GroupId) -> OrganizerResult<Deletion> {
            let (loc, _) = self.locate(Node::Group(id))?;
            self.groups_at_mut(&loc)?.remove_by_id(id)?;
            let mut removed = Deletion::default();
            self.drop_group(id, &mut removed);
            debug!(%id, collections = removed.collections, items = removed.items, "deleted group");
            Ok(removed)
        }

        /// Delete a space and everything it owns.
        pub fn delete_space(&mut self, id: SpaceId) -> OrganizerResult<Deletion> {
            self.order.remove_by_id(id)?;
            let mut removed = Deletion::default();
            if let Some(space) = self.spaces.shift_remove(&id) {
                for g in space.groups.iter() {
                    self.drop_group(g, &mut removed);
                }
                for c in space.collections.iter() {
                    self.drop_collection(c, &mut removed);
                }
            }
            debug!(%id, groups = removed.groups, items = removed.items, "deleted space");
            Ok(removed)
        }

        /* --------------------------- Invariants --------------------------- */

        /// Every id is owned by exactly one container and every listed id exists.
        pub fn check_invariants(&self) -> OrganizerResult<()> {
            check_keys(&self.spaces, |s| s.id)?;
            check_keys(&self.groups, |g| g.id)?;
            check_keys(&self.collections, |c| c.id)?;
            check_keys(&self.items, |i| i.id)?;
            if let Some(dup) = self.order.first_duplicate() {
                return Err(corrupt(format!("space {dup} listed twice")));
            }
            if self.order.len() != self.spaces.len()
                || self.order.iter().any(|id| !self.spaces.contains_key(&id))
            {
                return Err(corrupt("space order does not match space table".into()));
            }

            let mut group_owners: HashMap<GroupId, usize> = HashMap::new();
            let mut collection_owners: HashMap<CollectionId, usize> = HashMap::new();
            let mut item_owners: HashMap<WorkItemId, usize> = HashMap::new();

            for space in self.spaces.values() {
                for g in space.groups.iter() {
                    *group_owners.entry(g).or_default() += 1;
                }
                for c in space.collections.iter() {
                    *collection_owners.entry(c).or_default() += 1;
                }
            }
            for group in self.groups.values() {
                for c in group.collections.iter() {
                    *collection_owners.entry(c).or_default() += 1;
                }
            }
            for collection in self.collections.values() {
                for i in collection.items.iter() {
                    *item_owners.entry(i).or_default() += 1;
                }
            }

            check_owned(&group_owners, &self.groups)?;
            check_owned(&collection_owners, &self.collections)?;
            check_owned(&item_owners, &self.items)?;
            for item in self.items.values() {
                item.subtasks.check_dense()?;
            }
            Ok(())
        }

        pub(crate) fn normalize(&mut self) {
            for item in self.items.values_mut() {
                item.subtasks.normalize();
            }
        }

        /* ----------------------------- Helpers ----------------------------- */

        fn validate_locator(&self, loc: &Locator) -> OrganizerResult<()> {
            let space = self.space(loc.space())?;
            match *loc {
                Locator::SpaceGroups { .. } | Locator::SpaceCollections { .. } => Ok(()),
                Locator::GroupCollections { group, .. } => {
                    self.group(group)?;
                    if space.groups.contains(group) {
                        Ok(())
                    } else {
                        Err(OrganizerError::InvalidTarget(format!(
                            "group {group} is not in space {}",
                            space.id
                        )))
                    }
                }
                Locator::CollectionItems {
                    group, collection, ..
                } => {
                    self.collection(collection)?;
                    let owned = match group {
                        Some(g) => {
                            space.groups.contains(g) && self.group(g)?.collections.contains(collection)
                        }
                        None => space.collections.contains(collection),
                    };
                    if owned {
                        Ok(())
                    } else {
                        Err(OrganizerError::InvalidTarget(format!(
                            "collection {collection} is not at the given path"
                        )))
                    }
                }
            }
        }

        /// Position of `node` inside `from`; a stale node or locator is `NotFound`.
        fn position_in(&self, from: &Locator, node: Node) -> OrganizerResult<usize> {
            match self.container(from) {
                Ok(container) => container.position(node).ok_or_else(|| node.not_found()),
                Err(_) => Err(node.not_found()),
            }
        }

        fn collection_owner(&self, id: CollectionId) -> Option<(Locator, usize)> {
            self.spaces().find_map(|s| {
                if let Some(pos) = s.collections.position(id) {
                    return Some((Locator::SpaceCollections { space: s.id }, pos));
                }
                s.groups.iter().find_map(|g| {
                    let pos = self.groups.get(&g)?.collections.position(id)?;
                    Some((
                        Locator::GroupCollections {
                            space: s.id,
                            group: g,
                        },
                        pos,
                    ))
                })
            })
        }

        fn reveal(&mut self, to: &Locator) {
            if let Some(space) = self.spaces.get_mut(&to.space()) {
                space.open = true;
            }
            let group = match *to {
                Locator::GroupCollections { group, .. } => Some(group),
                Locator::CollectionItems { group, .. } => group,
                _ => None,
            };
            if let Some(group) = group.and_then(|g| self.groups.get_mut(&g)) {
                group.open = true;
            }
        }

        fn groups_at_mut(&mut self, loc: &Locator) -> OrganizerResult<&mut OrderedContainer<GroupId>> {
            match *loc {
                Locator::SpaceGroups { space } => Ok(&mut self.space_mut(space)?.groups),
                _ => Err(kind_mismatch(loc, ContainerKind::Groups)),
            }
        }

        fn collections_at_mut(
            &mut self,
            loc: &Locator,
        ) -> OrganizerResult<&mut OrderedContainer<CollectionId>> {
            match *loc {
                Locator::SpaceCollections { space } => Ok(&mut self.space_mut(space)?.collections),
                Locator::GroupCollections { group, .. } => {
                    Ok(&mut self.group_mut(group)?.collections)
                }
                _ => Err(kind_mismatch(loc, ContainerKind::Collections)),
            }
        }

        fn items_at_mut(
            &mut self,
            loc: &Locator,
        ) -> OrganizerResult<&mut OrderedContainer<WorkItemId>> {
            match *loc {
                Locator::CollectionItems { collection, .. } => {
                    Ok(&mut self.collection_mut(collection)?.items)
                }
                _ => Err(kind_mismatch(loc, ContainerKind::Items)),
            }
        }

        fn space_mut(&mut self, id: SpaceId) -> OrganizerResult<&mut Space> {
            self.spaces
                .get_mut(&id)
                .ok_or_else(|| OrganizerError::not_found(id))
        }

        fn group_mut(&mut self, id: GroupId) -> OrganizerResult<&mut Group> {
            self.groups
                .get_mut(&id)
                .ok_or_else(|| OrganizerError::not_found(id))
        }

        fn collection_mut(&mut self, id: CollectionId) -> OrganizerResult<&mut LeafCollection> {
            self.collections
                .get_mut(&id)
                .ok_or_else(|| OrganizerError::not_found(id))
        }

        fn item_mut(&mut self, id: WorkItemId) -> OrganizerResult<&mut WorkItem> {
            self.items
                .get_mut(&id)
                .ok_or_else(|| OrganizerError::not_found(id))
        }

        fn drop_group(&mut self, id: GroupId, removed: &mut Deletion) {
            if let Some(group) = self.groups.shift_remove(&id) {
                removed.groups += 1;
                for c in group.collections.iter() {
                    self.drop_collection(c, removed);
                }
            }
        }

        fn drop_collection(&mut self, id: CollectionId, removed: &mut Deletion) {
            if let Some(collection) = self.collections.shift_remove(&id) {
                removed.collections += 1;
                for i in collection.items.iter() {
                    if self.items.shift_remove(&i).is_some() {
                        removed.items += 1;
                    }
                }
            }
        }
    }

    fn corrupt(msg: String) -> OrganizerError {
        OrganizerError::CorruptSnapshot(msg)
    }

    fn kind_mismatch(loc: &Locator, wanted: ContainerKind) -> OrganizerError {
        OrganizerError::InvalidTarget(format!("{loc} does not hold {wanted:?}"))
    }

    /// Every table entry is stored under its own id.
    fn check_keys<I: EntityId, V>(
        table: &IndexMap<I, V>,
        id_of: impl Fn(&V) -> I,
    ) -> OrganizerResult<()> {
        match table.iter().find(|(key, value)| id_of(value) != **key) {
            Some((key, value)) => Err(corrupt(format!(
                "{} stored under {key} carries id {}",
                I::KIND,
                id_of(value)
            ))),
            None => Ok(()),
        }
    }

    fn check_owned<I: EntityId, V>(
        owners: &HashMap<I, usize>,
        table: &IndexMap<I, V>,
    ) -> OrganizerResult<()> {
        for (id, count) in owners {
            if !table.contains_key(id) {
                return Err(corrupt(format!("{} {id} is listed but does not exist", I::KIND)));
            }
            if *count != 1 {
                return Err(corrupt(format!("{} {id} has {count} owners", I::KIND)));
            }
        }
        if let Some(orphan) = table.keys().find(|id| !owners.contains_key(*id)) {
            return Err(corrupt(format!("{} {orphan} has no owner", I::KIND)));
        }
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use proptest::prelude::*;

        fn now() -> DateTime<Utc> {
            DateTime::from_timestamp(1_700_000_000, 0).unwrap()
        }

        struct Fixture {
            tree: WorkspaceTree,
            space1: SpaceId,
            space2: SpaceId,
            group_a: GroupId,
            in_group: CollectionId,
            at_root: CollectionId,
            items: Vec<WorkItemId>,
        }

        fn fixture() -> Fixture {
            let mut tree = WorkspaceTree::new();
            let space1 = tree.create_space("Client work", SpaceTag::default()).unwrap();
            let space2 = tree.create_space("Internal", SpaceTag::default()).unwrap();
            let group_a = tree.create_group(space1, "Group A", None).unwrap();
            let in_group = tree
                .create_collection(
                    &Locator::GroupCollections {
                        space: space1,
                        group: group_a,
                    },
                    "Launch",
                    None,
                )
                .unwrap();
            let at_root = tree
                .create_collection(&Locator::SpaceCollections { space: space2 }, "Ops", None)
                .unwrap();
            let list = tree.items_locator(in_group).unwrap();
            let items = ["one", "two", "three"]
                .iter()
                .map(|t| tree.create_item(&list, t, now(), None).unwrap())
                .collect();
            tree.toggle_space(space2).unwrap();
            Fixture {
                tree,
                space1,
                space2,
                group_a,
                in_group,
                at_root,
                items,
            }
        }

        #[test]
        fn collection_moves_from_group_to_other_space_root() {
            let mut f = fixture();
            assert!(!f.tree.space(f.space2).unwrap().open);
            let from = Locator::GroupCollections {
                space: f.space1,
                group: f.group_a,
            };
            let to = Locator::SpaceCollections { space: f.space2 };

            let outcome = f
                .tree
                .move_node(Node::Collection(f.in_group), &from, &to, 0)
                .unwrap();

            assert_eq!(outcome, MoveOutcome::Moved);
            assert!(!f.tree.group(f.group_a).unwrap().collections.contains(f.in_group));
            let root = &f.tree.space(f.space2).unwrap().collections;
            assert_eq!(root.position(f.in_group), Some(0));
            assert_eq!(root.position(f.at_root), Some(1));
            assert!(f.tree.space(f.space2).unwrap().open);
            // Items travel with their collection.
            assert_eq!(f.tree.collection(f.in_group).unwrap().items.len(), 3);
            f.tree.check_invariants().unwrap();
        }

        #[test]
        fn drop_on_current_slot_is_unchanged() {
            let mut f = fixture();
            let before = f.tree.clone();
            let list = f.tree.items_locator(f.in_group).unwrap();
            let outcome = f
                .tree
                .move_node(Node::WorkItem(f.items[2]), &list, &list, 10)
                .unwrap();
            assert_eq!(outcome, MoveOutcome::Unchanged);
            assert_eq!(f.tree, before);
        }

        #[test]
        fn reorder_within_collection() {
            let mut f = fixture();
            let list = f.tree.items_locator(f.in_group).unwrap();
            f.tree
                .move_node(Node::WorkItem(f.items[0]), &list, &list, 2)
                .unwrap();
            let order: Vec<_> = f.tree.collection(f.in_group).unwrap().items.iter().collect();
            assert_eq!(order, vec![f.items[1], f.items[2], f.items[0]]);
        }

        #[test]
        fn item_moves_across_spaces() {
            let mut f = fixture();
            let from = f.tree.items_locator(f.in_group).unwrap();
            let to = f.tree.items_locator(f.at_root).unwrap();
            f.tree
                .move_node(Node::WorkItem(f.items[1]), &from, &to, 0)
                .unwrap();
            assert_eq!(f.tree.locate(Node::WorkItem(f.items[1])).unwrap(), (to, 0));
            assert_eq!(f.tree.collection(f.in_group).unwrap().items.len(), 2);
            f.tree.check_invariants().unwrap();
        }

        #[test]
        fn stale_item_is_not_found_and_nothing_changes() {
            let mut f = fixture();
            let list = f.tree.items_locator(f.in_group).unwrap();
            let other = f.tree.items_locator(f.at_root).unwrap();
            f.tree.delete_item(f.items[0]).unwrap();
            let before = f.tree.clone();
            let err = f
                .tree
                .move_node(Node::WorkItem(f.items[0]), &list, &other, 0)
                .unwrap_err();
            assert!(matches!(err, OrganizerError::NotFound { kind: EntityKind::WorkItem, .. }));
            assert_eq!(f.tree, before);
        }

        #[test]
        fn group_is_rejected_by_collection_container() {
            let mut f = fixture();
            let before = f.tree.clone();
            let err = f
                .tree
                .move_node(
                    Node::Group(f.group_a),
                    &Locator::SpaceGroups { space: f.space1 },
                    &Locator::SpaceCollections { space: f.space2 },
                    0,
                )
                .unwrap_err();
            assert!(matches!(err, OrganizerError::InvalidTarget(_)));
            assert_eq!(f.tree, before);
        }

        #[test]
        fn toggling_does_not_touch_ownership() {
            let mut f = fixture();
            assert!(!f.tree.toggle_group(f.group_a).unwrap());
            assert!(f.tree.group(f.group_a).unwrap().collections.contains(f.in_group));
            f.tree.check_invariants().unwrap();
        }

        #[test]
        fn deleting_a_space_cascades() {
            let mut f = fixture();
            let removed = f.tree.delete_space(f.space1).unwrap();
            assert_eq!(
                removed,
                Deletion {
                    groups: 1,
                    collections: 1,
                    items: 3
                }
            );
            assert_eq!(f.tree.item_count(), 0);
            f.tree.check_invariants().unwrap();
        }

        #[test]
        fn mismatched_locator_path_is_invalid_target() {
            let f = fixture();
            let bogus = Locator::GroupCollections {
                space: f.space2,
                group: f.group_a,
            };
            assert!(matches!(
                f.tree.container(&bogus),
                Err(OrganizerError::InvalidTarget(_))
            ));
        }

        #[test]
        fn patch_updates_fields() {
            let mut f = fixture();
            let later = now() + chrono::Duration::hours(1);
            f.tree
                .update_item(
                    f.items[0],
                    WorkItemPatch {
                        status: Some(Status::Done),
                        priority: Some(Some(Priority::High)),
                        description: Some(Some("ship it".into())),
                        ..WorkItemPatch::default()
                    },
                    later,
                )
                .unwrap();
            let item = f.tree.item(f.items[0]).unwrap();
            assert_eq!(item.status, Status::Done);
            assert_eq!(item.meta.priority, Some(Priority::High));
            assert_eq!(item.meta.updated_at, Some(later));
            assert_eq!(item.meta.created_at, Some(now()));
        }

        /* ---------------------- Ownership property ---------------------- */

        fn populated_tree() -> WorkspaceTree {
            let mut tree = WorkspaceTree::new();
            for s in 0..2 {
                let space = tree.create_space(&format!("space {s}"), SpaceTag::default()).unwrap();
                for g in 0..2 {
                    let group = tree.create_group(space, &format!("group {g}"), None).unwrap();
                    for c in 0..2 {
                        let at = Locator::GroupCollections { space, group };
                        let coll = tree.create_collection(&at, &format!("list {c}"), None).unwrap();
                        let list = tree.items_locator(coll).unwrap();
                        for i in 0..3 {
                            tree.create_item(&list, &format!("task {i}"), now(), None).unwrap();
                        }
                    }
                }
                let root = Locator::SpaceCollections { space };
                let coll = tree.create_collection(&root, "loose", None).unwrap();
                let list = tree.items_locator(coll).unwrap();
                tree.create_item(&list, "loose task", now(), None).unwrap();
            }
            tree
        }

        fn all_locators(tree: &WorkspaceTree, kind: ContainerKind) -> Vec<Locator> {
            let mut out = Vec::new();
            for space in tree.spaces() {
                match kind {
                    ContainerKind::Groups => out.push(Locator::SpaceGroups { space: space.id }),
                    ContainerKind::Collections => {
                        out.push(Locator::SpaceCollections { space: space.id });
                        for g in space.groups.iter() {
                            out.push(Locator::GroupCollections { space: space.id, group: g });
                        }
                    }
                    ContainerKind::Items => {}
                }
            }
            if kind == ContainerKind::Items {
                let mut ids: Vec<_> = tree.collections.keys().copied().collect();
                ids.sort();
                out.extend(ids.into_iter().filter_map(|c| tree.items_locator(c)));
            }
            out
        }

        fn pick_node(tree: &WorkspaceTree, kind: u8, idx: usize) -> Node {
            match kind {
                0 => {
                    let mut ids: Vec<_> = tree.items.keys().copied().collect();
                    ids.sort();
                    Node::WorkItem(ids[idx % ids.len()])
                }
                1 => {
                    let mut ids: Vec<_> = tree.collections.keys().copied().collect();
                    ids.sort();
                    Node::Collection(ids[idx % ids.len()])
                }
                _ => {
                    let mut ids: Vec<_> = tree.groups.keys().copied().collect();
                    ids.sort();
                    Node::Group(ids[idx % ids.len()])
                }
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

            #[test]
            fn moves_conserve_ownership(
                ops in prop::collection::vec((0u8..3, 0usize..64, 0usize..64, 0usize..8), 0..40)
            ) {
                let mut tree = populated_tree();
                let items = tree.item_count();
                let collections = tree.collection_count();
                let groups = tree.group_count();

                for (kind, node_idx, dest_idx, at) in ops {
                    let node = pick_node(&tree, kind, node_idx);
                    let (from, _) = tree.locate(node).unwrap();
                    let dests = all_locators(&tree, node.container_kind());
                    let to = dests[dest_idx % dests.len()];
                    tree.move_node(node, &from, &to, at).unwrap();
                    prop_assert!(tree.check_invariants().is_ok());
                }

                prop_assert_eq!(tree.item_count(), items);
                prop_assert_eq!(tree.collection_count(), collections);
                prop_assert_eq!(tree.group_count(), groups);
                let listed: usize = tree.collections.values().map(|c| c.items.len()).sum();
                prop_assert_eq!(listed, items);
            }
        }
    }
}

pub mod gate {
    //! Confirmation gate for destructive pipeline actions (stage deletion, card archiving).

    use crate::core::{OrganizerError, OrganizerResult};

    /// Proof that a confirmation check passed. Only a gate can produce one.
    #[derive(Debug)]
    pub struct Authorized {
        _proof: (),
    }

    impl Authorized {
        fn granted() -> Self {
            Self { _proof: () }
        }
    }

    /// Pluggable authorization check; the product policy decides what a token is.
    pub trait ConfirmationGate {
        fn confirm(&self, token: &str) -> OrganizerResult<Authorized>;
    }

    /// Accepts exactly one configured secret.
    #[derive(Debug, Clone)]
    pub struct SharedSecretGate {
        secret: String,
    }

    impl SharedSecretGate {
        pub fn new(secret: impl Into<String>) -> Self {
            Self {
                secret: secret.into(),
            }
        }
    }

    impl ConfirmationGate for SharedSecretGate {
        fn confirm(&self, token: &str) -> OrganizerResult<Authorized> {
            if !self.secret.is_empty() && constant_time_eq(self.secret.as_bytes(), token.as_bytes())
            {
                Ok(Authorized::granted())
            } else {
                tracing::warn!("confirmation token rejected");
                Err(OrganizerError::Unauthorized)
            }
        }
    }

    /// Used when no secret is configured: destructive actions are unavailable.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct DenyAllGate;

    impl ConfirmationGate for DenyAllGate {
        fn confirm(&self, _token: &str) -> OrganizerResult<Authorized> {
            Err(OrganizerError::Unauthorized)
        }
    }

    fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn shared_secret_accepts_only_its_token() {
            let gate = SharedSecretGate::new("hunter2");
            assert!(gate.confirm("hunter2").is_ok());
            assert_eq!(gate.confirm("hunter3").unwrap_err(), OrganizerError::Unauthorized);
            assert_eq!(gate.confirm("").unwrap_err(), OrganizerError::Unauthorized);
        }

        #[test]
        fn empty_secret_never_authorizes() {
            let gate = SharedSecretGate::new("");
            assert!(gate.confirm("").is_err());
        }

        #[test]
        fn deny_all_rejects() {
            assert!(DenyAllGate.confirm("anything").is_err());
        }
    }
}

pub mod pipeline {
    //! Linear stage pipeline.
    //!
    //! Stages are numbered `1..=N` with no gaps. Cards live in one flat table; "being in a
    //! stage" is the card's `stage` reference, so moving a card between stages is a field
    //! rewrite with no container bookkeeping. Renumbering keeps every reference in range.

    use crate::core::*;
    use crate::gate::Authorized;
    use chrono::{DateTime, Utc};
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use tracing::debug;

    /// Instructions given to a freshly inserted stage.
    pub const PLACEHOLDER_INSTRUCTIONS: &str =
        "Describe what needs to happen before a card leaves this stage.";

    /// Built-in sixteen-step workflow as `(title, short title)`.
    pub const DEFAULT_STAGES: [(&str, &str); 16] = [
        ("Discovery call", "Discovery"),
        ("Proposal", "Proposal"),
        ("Contract signed", "Contract"),
        ("Kickoff", "Kickoff"),
        ("Content gathering", "Content"),
        ("Sitemap", "Sitemap"),
        ("Wireframes", "Wireframes"),
        ("Visual design", "Design"),
        ("Design review", "Review"),
        ("Build", "Build"),
        ("Content entry", "Entry"),
        ("Quality assurance", "QA"),
        ("Client review", "Client"),
        ("Revisions", "Revisions"),
        ("Launch", "Launch"),
        ("Post-launch care", "Care"),
    ];

    /// Result of `delete_stage`.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct StageDeletion {
        pub removed: Stage,
        /// Stage number (after renumbering) that received the removed stage's cards.
        pub spilled_into: u32,
        pub reassigned: Vec<CardId>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Pipeline {
        stages: Vec<Stage>,
        #[serde(default)]
        cards: IndexMap<CardId, Card>,
    }

    impl Default for Pipeline {
        fn default() -> Self {
            Self::with_default_stages()
        }
    }

    impl Pipeline {
        pub fn with_default_stages() -> Self {
            Self {
                stages: numbered(
                    DEFAULT_STAGES
                        .iter()
                        .map(|(t, s)| (t.to_string(), s.to_string())),
                ),
                cards: IndexMap::new(),
            }
        }

        /// Build a pipeline from `(title, short title)` pairs; at least one is required.
        pub fn from_titles(
            titles: impl IntoIterator<Item = (String, String)>,
        ) -> OrganizerResult<Self> {
            let stages = numbered(titles.into_iter());
            if stages.is_empty() {
                return Err(OrganizerError::InvalidInput(
                    "a pipeline needs at least one stage".into(),
                ));
            }
            for stage in &stages {
                non_empty("stage title", &stage.title)?;
            }
            Ok(Self {
                stages,
                cards: IndexMap::new(),
            })
        }

        /* ------------------------------ Reads ------------------------------ */

        pub fn stages(&self) -> &[Stage] {
            &self.stages
        }

        pub fn stage_count(&self) -> u32 {
            self.stages.len() as u32
        }

        pub fn stage(&self, number: u32) -> OrganizerResult<&Stage> {
            self.index_of(number).map(|i| &self.stages[i])
        }

        /// All cards, archived included, in creation order.
        pub fn cards(&self) -> impl Iterator<Item = &Card> {
            self.cards.values()
        }

        pub fn card(&self, id: CardId) -> OrganizerResult<&Card> {
            self.cards
                .get(&id)
                .ok_or_else(|| OrganizerError::not_found(id))
        }

        /* ----------------------------- Stages ----------------------------- */

        /// Insert a stage right after `after` (0 inserts at the front). Later stages and the
        /// cards that reference them shift up by one. Returns the new stage's number.
        pub fn insert_stage_after(
            &mut self,
            after: u32,
            title: &str,
            short_title: &str,
        ) -> OrganizerResult<u32> {
            if after > self.stage_count() {
                return Err(OrganizerError::stage_not_found(after));
            }
            let title = non_empty("stage title", title)?;
            let number = after + 1;

            for stage in self.stages.iter_mut().filter(|s| s.number > after) {
                stage.number += 1;
            }
            for card in self.cards.values_mut().filter(|c| c.stage > after) {
                card.stage += 1;
            }
            self.stages.insert(
                after as usize,
                Stage {
                    number,
                    short_title: short_or(&title, short_title),
                    title,
                    instructions: PLACEHOLDER_INSTRUCTIONS.to_string(),
                },
            );
            debug!(number, total = self.stages.len(), "inserted stage");
            Ok(number)
        }

        /// Delete stage `number`. Its cards spill into the previous stage (stage 1 when
        /// deleting stage 1), then later stages and references shift down by one.
        pub fn delete_stage(
            &mut self,
            number: u32,
            _confirmed: &Authorized,
        ) -> OrganizerResult<StageDeletion> {
            if self.stages.len() <= 1 {
                return Err(OrganizerError::CannotDeleteLastStage);
            }
            let index = self.index_of(number)?;
            let spill = number.saturating_sub(1).max(1);

            // Reassign first: once later stages are renumbered, `number` means something else.
            let mut reassigned = Vec::new();
            for card in self.cards.values_mut().filter(|c| c.stage == number) {
                card.stage = spill;
                reassigned.push(card.id);
            }

            let removed = self.stages.remove(index);
            for stage in self.stages.iter_mut().filter(|s| s.number > number) {
                stage.number -= 1;
            }
            for card in self.cards.values_mut().filter(|c| c.stage > number) {
                card.stage -= 1;
            }
            debug!(
                number,
                spill,
                reassigned = reassigned.len(),
                total = self.stages.len(),
                "deleted stage"
            );
            Ok(StageDeletion {
                removed,
                spilled_into: spill,
                reassigned,
            })
        }

        pub fn rename_stage(
            &mut self,
            number: u32,
            title: &str,
            short_title: &str,
        ) -> OrganizerResult<()> {
            let title = non_empty("stage title", title)?;
            let index = self.index_of(number)?;
            let stage = &mut self.stages[index];
            stage.short_title = short_or(&title, short_title);
            stage.title = title;
            Ok(())
        }

        pub fn set_instructions(&mut self, number: u32, instructions: &str) -> OrganizerResult<()> {
            let index = self.index_of(number)?;
            self.stages[index].instructions = instructions.to_string();
            Ok(())
        }

        /* ------------------------------ Cards ------------------------------ */

        pub fn create_card(
            &mut self,
            name: &str,
            stage: u32,
            now: DateTime<Utc>,
        ) -> OrganizerResult<CardId> {
            let name = non_empty("card name", name)?;
            self.index_of(stage)?;
            let card = Card {
                id: CardId::new(),
                name,
                fields: IndexMap::new(),
                stage,
                created_at: now,
                archived: false,
                subtasks: SubtaskList::default(),
            };
            let id = card.id;
            self.cards.insert(id, card);
            debug!(%id, stage, "created card");
            Ok(id)
        }

        /// Drop handler for the board: rewrite the card's stage reference.
        pub fn move_card_to_stage(&mut self, id: CardId, target: u32) -> OrganizerResult<MoveOutcome> {
            if self.index_of(target).is_err() {
                return Err(OrganizerError::InvalidTarget(format!(
                    "stage {target} is outside 1..={}",
                    self.stage_count()
                )));
            }
            let card = self.card_mut(id)?;
            if card.stage == target {
                return Ok(MoveOutcome::Unchanged);
            }
            let from = card.stage;
            card.stage = target;
            debug!(%id, from, to = target, "moved card");
            Ok(MoveOutcome::Moved)
        }

        pub fn rename_card(&mut self, id: CardId, name: &str) -> OrganizerResult<()> {
            let name = non_empty("card name", name)?;
            self.card_mut(id)?.name = name;
            Ok(())
        }

        /// Set a free-text field; an empty value removes it.
        pub fn set_field(&mut self, id: CardId, key: &str, value: &str) -> OrganizerResult<()> {
            let key = non_empty("field name", key)?;
            let card = self.card_mut(id)?;
            if value.trim().is_empty() {
                card.fields.shift_remove(&key);
            } else {
                card.fields.insert(key, value.to_string());
            }
            Ok(())
        }

        pub fn archive_card(&mut self, id: CardId, _confirmed: &Authorized) -> OrganizerResult<()> {
            self.card_mut(id)?.archived = true;
            debug!(%id, "archived card");
            Ok(())
        }

        pub fn unarchive_card(&mut self, id: CardId) -> OrganizerResult<()> {
            self.card_mut(id)?.archived = false;
            Ok(())
        }

        pub fn edit_subtasks<T>(
            &mut self,
            id: CardId,
            f: impl FnOnce(&mut SubtaskList) -> OrganizerResult<T>,
        ) -> OrganizerResult<T> {
            f(&mut self.card_mut(id)?.subtasks)
        }

        /* --------------------------- Invariants --------------------------- */

        /// Stages are exactly `1..=N` and every card references one of them.
        pub fn check_invariants(&self) -> OrganizerResult<()> {
            if self.stages.is_empty() {
                return Err(OrganizerError::CorruptSnapshot("pipeline has no stages".into()));
            }
            for (pos, stage) in self.stages.iter().enumerate() {
                if stage.number as usize != pos + 1 {
                    return Err(OrganizerError::CorruptSnapshot(format!(
                        "stage at position {} is numbered {}",
                        pos + 1,
                        stage.number
                    )));
                }
            }
            let n = self.stage_count();
            for (key, card) in &self.cards {
                if card.id != *key {
                    return Err(OrganizerError::CorruptSnapshot(format!(
                        "card stored under {key} carries id {}",
                        card.id
                    )));
                }
                if card.stage == 0 || card.stage > n {
                    return Err(OrganizerError::CorruptSnapshot(format!(
                        "card {} references stage {} outside 1..={n}",
                        card.id, card.stage
                    )));
                }
                card.subtasks.check_dense()?;
            }
            Ok(())
        }

        pub(crate) fn normalize(&mut self) {
            for card in self.cards.values_mut() {
                card.subtasks.normalize();
            }
        }

        fn index_of(&self, number: u32) -> OrganizerResult<usize> {
            if number == 0 || number > self.stage_count() {
                return Err(OrganizerError::stage_not_found(number));
            }
            Ok(number as usize - 1)
        }

        fn card_mut(&mut self, id: CardId) -> OrganizerResult<&mut Card> {
            self.cards
                .get_mut(&id)
                .ok_or_else(|| OrganizerError::not_found(id))
        }
    }

    fn numbered(titles: impl Iterator<Item = (String, String)>) -> Vec<Stage> {
        titles
            .enumerate()
            .map(|(i, (title, short))| Stage {
                number: i as u32 + 1,
                short_title: short_or(&title, &short),
                title,
                instructions: String::new(),
            })
            .collect()
    }

    fn short_or(title: &str, short: &str) -> String {
        let short = short.trim();
        if short.is_empty() {
            title.to_string()
        } else {
            short.to_string()
        }
    }

}

pub mod drag {
    //! Interactive move session.
    //!
    //! `Idle → Dragging → (HoveringLegalTarget | HoveringNoTarget) → (Dropped | Cancelled) → Idle`.
    //! Hovering only reads the documents; the single write happens in `commit_drop`, and only
    //! from `HoveringLegalTarget`. A drop on an idle session is ignored, so duplicate drop
    //! events are harmless.

    use crate::core::*;
    use crate::engine::Documents;
    use crate::tree::{Locator, Node};
    use tracing::{debug, warn};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum DragItem {
        WorkItem(WorkItemId),
        Collection(CollectionId),
        Group(GroupId),
        Card(CardId),
    }

    impl DragItem {
        pub fn as_node(&self) -> Option<Node> {
            match *self {
                DragItem::WorkItem(id) => Some(Node::WorkItem(id)),
                DragItem::Collection(id) => Some(Node::Collection(id)),
                DragItem::Group(id) => Some(Node::Group(id)),
                DragItem::Card(_) => None,
            }
        }
    }

    /// Where the dragged item was picked up.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Origin {
        Tree { locator: Locator, index: usize },
        Stage(u32),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DragSource {
        pub item: DragItem,
        pub origin: Origin,
    }

    /// Candidate drop surfaces.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DropTarget {
        /// A space root; takes groups and leaf collections, appended.
        Space(SpaceId),
        /// A group; takes leaf collections, appended.
        Group { space: SpaceId, group: GroupId },
        /// A leaf collection; takes work items, appended.
        Collection {
            space: SpaceId,
            group: Option<GroupId>,
            collection: CollectionId,
        },
        /// A specific slot between two siblings.
        Between { locator: Locator, index: usize },
        /// A pipeline stage column; takes cards.
        Stage(u32),
    }

    /// Why a hovered surface will not accept the drop.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Rejection {
        WrongKind,
        MissingTarget,
        SamePosition,
        StaleSource,
    }

    /// Resolved destination of a legal drop.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Placement {
        Tree { to: Locator, index: usize },
        Stage(u32),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DragPhase {
        Idle,
        Dragging,
        HoveringLegalTarget,
        HoveringNoTarget,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DropOutcome {
        Dropped {
            source: DragSource,
            placement: Placement,
            outcome: MoveOutcome,
        },
        Cancelled,
        /// No drag was active (e.g. a duplicated drop event).
        Ignored,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Hover {
        Nothing,
        Legal {
            target: DropTarget,
            placement: Placement,
        },
        NoTarget {
            rejected: Option<(DropTarget, Rejection)>,
        },
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum State {
        Idle,
        Active { source: DragSource, hover: Hover },
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct DragSession {
        state: State,
    }

    impl Default for DragSession {
        fn default() -> Self {
            Self::new()
        }
    }

    impl DragSession {
        pub fn new() -> Self {
            Self { state: State::Idle }
        }

        pub fn phase(&self) -> DragPhase {
            match self.state {
                State::Idle => DragPhase::Idle,
                State::Active { hover, .. } => match hover {
                    Hover::Nothing => DragPhase::Dragging,
                    Hover::Legal { .. } => DragPhase::HoveringLegalTarget,
                    Hover::NoTarget { .. } => DragPhase::HoveringNoTarget,
                },
            }
        }

        pub fn source(&self) -> Option<DragSource> {
            match self.state {
                State::Active { source, .. } => Some(source),
                State::Idle => None,
            }
        }

        /// The surface to highlight, when the hovered one is legal.
        pub fn highlighted(&self) -> Option<DropTarget> {
            match self.state {
                State::Active {
                    hover: Hover::Legal { target, .. },
                    ..
                } => Some(target),
                _ => None,
            }
        }

        pub fn rejection(&self) -> Option<(DropTarget, Rejection)> {
            match self.state {
                State::Active {
                    hover: Hover::NoTarget { rejected },
                    ..
                } => rejected,
                _ => None,
            }
        }

        /// Pick up `item`, recording where it currently lives. A drag already in progress is
        /// cancelled first.
        pub fn begin(&mut self, item: DragItem, docs: &Documents) -> OrganizerResult<()> {
            if self.phase() != DragPhase::Idle {
                debug!("new drag interrupts the active one");
                self.cancel();
            }
            let origin = match item {
                DragItem::Card(id) => Origin::Stage(docs.pipeline.card(id)?.stage),
                DragItem::WorkItem(id) => tree_origin(docs, Node::WorkItem(id))?,
                DragItem::Collection(id) => tree_origin(docs, Node::Collection(id))?,
                DragItem::Group(id) => tree_origin(docs, Node::Group(id))?,
            };
            let source = DragSource { item, origin };
            debug!(?source, "drag started");
            self.state = State::Active {
                source,
                hover: Hover::Nothing,
            };
            Ok(())
        }

        /// Enter (or move to) a candidate surface and compute its legality.
        pub fn hover(&mut self, target: DropTarget, docs: &Documents) -> DragPhase {
            if let State::Active { source, hover } = &mut self.state {
                *hover = match legality(source, &target, docs) {
                    Ok(placement) => Hover::Legal { target, placement },
                    Err(reason) => Hover::NoTarget {
                        rejected: Some((target, reason)),
                    },
                };
            }
            self.phase()
        }

        /// Pointer left every surface while still dragging.
        pub fn leave(&mut self) -> DragPhase {
            if let State::Active { hover, .. } = &mut self.state {
                *hover = Hover::NoTarget { rejected: None };
            }
            self.phase()
        }

        /// Abort without touching the documents (Escape, lost pointer capture, ...).
        pub fn cancel(&mut self) -> DropOutcome {
            match std::mem::replace(&mut self.state, State::Idle) {
                State::Idle => DropOutcome::Ignored,
                State::Active { source, .. } => {
                    debug!(?source, "drag cancelled");
                    DropOutcome::Cancelled
                }
            }
        }

        /// Release over the current surface. Commits only from `HoveringLegalTarget`; the
        /// session is `Idle` afterwards whatever happens.
        pub fn commit_drop(&mut self, docs: &mut Documents) -> OrganizerResult<DropOutcome> {
            let (source, placement) = match std::mem::replace(&mut self.state, State::Idle) {
                State::Idle => {
                    debug!("drop ignored: no active drag");
                    return Ok(DropOutcome::Ignored);
                }
                State::Active {
                    source,
                    hover: Hover::Legal { placement, .. },
                } => (source, placement),
                State::Active { source, .. } => {
                    debug!(?source, "drop outside a legal target; cancelled");
                    return Ok(DropOutcome::Cancelled);
                }
            };

            let result = match (source.item, source.origin, placement) {
                (DragItem::Card(id), Origin::Stage(_), Placement::Stage(stage)) => {
                    docs.pipeline.move_card_to_stage(id, stage)
                }
                (item, Origin::Tree { locator, .. }, Placement::Tree { to, index }) => {
                    match item.as_node() {
                        Some(node) => docs.tree.move_node(node, &locator, &to, index),
                        None => Err(OrganizerError::InvalidTarget(
                            "cards only land on stage columns".into(),
                        )),
                    }
                }
                _ => Err(OrganizerError::InvalidTarget(format!(
                    "{:?} cannot land on {placement:?}",
                    source.item
                ))),
            };

            match result {
                Ok(outcome) => Ok(DropOutcome::Dropped {
                    source,
                    placement,
                    outcome,
                }),
                Err(err) => {
                    warn!(%err, ?source, "drop aborted");
                    Err(err)
                }
            }
        }
    }

    /// Pure legality check for dropping `source` on `target`.
    pub fn legality(
        source: &DragSource,
        target: &DropTarget,
        docs: &Documents,
    ) -> Result<Placement, Rejection> {
        match (source.item, *target) {
            (DragItem::Card(id), DropTarget::Stage(stage)) => {
                docs.pipeline
                    .stage(stage)
                    .map_err(|_| Rejection::MissingTarget)?;
                let card = docs.pipeline.card(id).map_err(|_| Rejection::StaleSource)?;
                if card.stage == stage {
                    return Err(Rejection::SamePosition);
                }
                Ok(Placement::Stage(stage))
            }
            (DragItem::Card(_), _) | (_, DropTarget::Stage(_)) => Err(Rejection::WrongKind),
            (item, target) => {
                let Some(node) = item.as_node() else {
                    return Err(Rejection::WrongKind);
                };
                let (to, index) = resolve_tree_target(node, target)?;
                docs.tree
                    .container(&to)
                    .map_err(|_| Rejection::MissingTarget)?;
                let Origin::Tree { locator: from, .. } = source.origin else {
                    return Err(Rejection::WrongKind);
                };
                // A header drop onto the current owner is not a reorder request.
                if from == to && !matches!(target, DropTarget::Between { .. }) {
                    return Err(Rejection::SamePosition);
                }
                match docs.tree.would_move(node, &from, &to, index) {
                    Ok(true) => Ok(Placement::Tree { to, index }),
                    Ok(false) => Err(Rejection::SamePosition),
                    Err(_) => Err(Rejection::StaleSource),
                }
            }
        }
    }

    fn tree_origin(docs: &Documents, node: Node) -> OrganizerResult<Origin> {
        let (locator, index) = docs.tree.locate(node)?;
        Ok(Origin::Tree { locator, index })
    }

    fn resolve_tree_target(node: Node, target: DropTarget) -> Result<(Locator, usize), Rejection> {
        let append = usize::MAX;
        match (node, target) {
            (Node::Group(_), DropTarget::Space(space)) => Ok((Locator::SpaceGroups { space }, append)),
            (Node::Collection(_), DropTarget::Space(space)) => {
                Ok((Locator::SpaceCollections { space }, append))
            }
            (Node::Collection(_), DropTarget::Group { space, group }) => {
                Ok((Locator::GroupCollections { space, group }, append))
            }
            (
                Node::WorkItem(_),
                DropTarget::Collection {
                    space,
                    group,
                    collection,
                },
            ) => Ok((
                Locator::CollectionItems {
                    space,
                    group,
                    collection,
                },
                append,
            )),
            (node, DropTarget::Between { locator, index }) => {
                if locator.kind() == node.container_kind() {
                    Ok((locator, index))
                } else {
                    Err(Rejection::WrongKind)
                }
            }
            _ => Err(Rejection::WrongKind),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::tree::WorkspaceTree;
        use crate::pipeline::Pipeline;
        use chrono::{DateTime, Utc};

        fn now() -> DateTime<Utc> {
            DateTime::from_timestamp(1_700_000_000, 0).unwrap()
        }

        struct Board {
            docs: Documents,
            space1: SpaceId,
            space2: SpaceId,
            group: GroupId,
            list: CollectionId,
            item: WorkItemId,
            card: CardId,
        }

        fn board() -> Board {
            let mut tree = WorkspaceTree::new();
            let space1 = tree.create_space("One", SpaceTag::default()).unwrap();
            let space2 = tree.create_space("Two", SpaceTag::default()).unwrap();
            let group = tree.create_group(space1, "Folder", None).unwrap();
            let list = tree
                .create_collection(&Locator::GroupCollections { space: space1, group }, "List", None)
                .unwrap();
            let at = tree.items_locator(list).unwrap();
            let item = tree.create_item(&at, "Task", now(), None).unwrap();
            let mut pipeline = Pipeline::with_default_stages();
            let card = pipeline.create_card("acme.test", 3, now()).unwrap();
            Board {
                docs: Documents { tree, pipeline },
                space1,
                space2,
                group,
                list,
                item,
                card,
            }
        }

        #[test]
        fn full_drop_cycle_moves_collection() {
            let mut b = board();
            let mut session = DragSession::new();
            session.begin(DragItem::Collection(b.list), &b.docs).unwrap();
            assert_eq!(session.phase(), DragPhase::Dragging);

            assert_eq!(
                session.hover(DropTarget::Space(b.space2), &b.docs),
                DragPhase::HoveringLegalTarget
            );
            assert_eq!(session.highlighted(), Some(DropTarget::Space(b.space2)));

            let outcome = session.commit_drop(&mut b.docs).unwrap();
            assert!(matches!(
                outcome,
                DropOutcome::Dropped {
                    outcome: MoveOutcome::Moved,
                    ..
                }
            ));
            assert_eq!(session.phase(), DragPhase::Idle);
            assert!(b.docs.tree.space(b.space2).unwrap().collections.contains(b.list));
        }

        #[test]
        fn group_target_only_accepts_collections() {
            let b = board();
            let mut session = DragSession::new();
            session.begin(DragItem::Group(b.group), &b.docs).unwrap();
            let target = DropTarget::Group {
                space: b.space1,
                group: b.group,
            };
            assert_eq!(session.hover(target, &b.docs), DragPhase::HoveringNoTarget);
            assert_eq!(session.rejection(), Some((target, Rejection::WrongKind)));
        }

        #[test]
        fn same_slot_is_suppressed_before_commit() {
            let mut b = board();
            let before = b.docs.clone();
            let mut session = DragSession::new();
            session.begin(DragItem::WorkItem(b.item), &b.docs).unwrap();
            let target = DropTarget::Collection {
                space: b.space1,
                group: Some(b.group),
                collection: b.list,
            };
            assert_eq!(session.hover(target, &b.docs), DragPhase::HoveringNoTarget);
            assert_eq!(session.rejection(), Some((target, Rejection::SamePosition)));
            assert_eq!(session.commit_drop(&mut b.docs).unwrap(), DropOutcome::Cancelled);
            assert_eq!(b.docs, before);
        }

        #[test]
        fn header_drop_on_current_owner_keeps_order() {
            let mut b = board();
            let at = Locator::GroupCollections {
                space: b.space1,
                group: b.group,
            };
            b.docs.tree.create_collection(&at, "Second", None).unwrap();
            let before = b.docs.clone();

            let mut session = DragSession::new();
            session.begin(DragItem::Collection(b.list), &b.docs).unwrap();
            let header = DropTarget::Group {
                space: b.space1,
                group: b.group,
            };
            assert_eq!(session.hover(header, &b.docs), DragPhase::HoveringNoTarget);
            assert_eq!(session.rejection(), Some((header, Rejection::SamePosition)));

            let slot = DropTarget::Between { locator: at, index: 1 };
            assert_eq!(session.hover(slot, &b.docs), DragPhase::HoveringLegalTarget);
            session.cancel();
            assert_eq!(b.docs, before);
        }

        #[test]
        fn duplicate_drop_is_ignored() {
            let mut b = board();
            let mut session = DragSession::new();
            session.begin(DragItem::Card(b.card), &b.docs).unwrap();
            session.hover(DropTarget::Stage(7), &b.docs);
            assert!(matches!(
                session.commit_drop(&mut b.docs).unwrap(),
                DropOutcome::Dropped { .. }
            ));
            let after_first = b.docs.clone();
            assert_eq!(session.commit_drop(&mut b.docs).unwrap(), DropOutcome::Ignored);
            assert_eq!(b.docs, after_first);
            assert_eq!(b.docs.pipeline.card(b.card).unwrap().stage, 7);
        }

        #[test]
        fn card_cannot_land_in_tree() {
            let b = board();
            let mut session = DragSession::new();
            session.begin(DragItem::Card(b.card), &b.docs).unwrap();
            assert_eq!(
                session.hover(DropTarget::Space(b.space1), &b.docs),
                DragPhase::HoveringNoTarget
            );
            assert_eq!(
                session.hover(DropTarget::Stage(40), &b.docs),
                DragPhase::HoveringNoTarget
            );
            assert_eq!(session.rejection(), Some((DropTarget::Stage(40), Rejection::MissingTarget)));
        }

        #[test]
        fn cancel_and_leave_leave_documents_alone() {
            let b = board();
            let before = b.docs.clone();
            let mut session = DragSession::new();
            session.begin(DragItem::Collection(b.list), &b.docs).unwrap();
            session.hover(DropTarget::Space(b.space2), &b.docs);
            assert_eq!(session.leave(), DragPhase::HoveringNoTarget);
            assert_eq!(session.cancel(), DropOutcome::Cancelled);
            assert_eq!(session.cancel(), DropOutcome::Ignored);
            assert_eq!(session.phase(), DragPhase::Idle);
            assert_eq!(b.docs, before);
        }

        #[test]
        fn source_deleted_mid_drag_aborts_without_mutation() {
            let mut b = board();
            let mut session = DragSession::new();
            session.begin(DragItem::WorkItem(b.item), &b.docs).unwrap();
            let other = b
                .docs
                .tree
                .create_collection(&Locator::SpaceCollections { space: b.space2 }, "Other", None)
                .unwrap();
            session.hover(
                DropTarget::Collection {
                    space: b.space2,
                    group: None,
                    collection: other,
                },
                &b.docs,
            );
            assert_eq!(session.phase(), DragPhase::HoveringLegalTarget);

            b.docs.tree.delete_item(b.item).unwrap();
            let before = b.docs.clone();
            let err = session.commit_drop(&mut b.docs).unwrap_err();
            assert!(matches!(err, OrganizerError::NotFound { .. }));
            assert_eq!(session.phase(), DragPhase::Idle);
            assert_eq!(b.docs, before);
        }
    }
}

pub mod snapshot {
    //! Versioned JSON snapshots of the tree and the pipeline.
    //!
    //! Records missing newer fields decode with defaults. Anything that fails to parse or
    //! violates the document invariants is `CorruptSnapshot`; `restore` turns that into the
    //! fallback state plus a notice instead of an error.

    use crate::core::{OrganizerError, OrganizerResult};
    use crate::pipeline::Pipeline;
    use crate::tree::WorkspaceTree;
    use serde::{Deserialize, Serialize, de::DeserializeOwned};
    use tracing::warn;

    pub const FORMAT_VERSION: u32 = 1;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum SnapshotKind {
        Tree,
        Pipeline,
    }

    /// A document that can be written to and read back from a snapshot record.
    pub trait Snapshot: Serialize + DeserializeOwned {
        const KIND: SnapshotKind;

        /// Repair what can be repaired, then verify invariants.
        fn validate(&mut self) -> OrganizerResult<()>;
    }

    impl Snapshot for WorkspaceTree {
        const KIND: SnapshotKind = SnapshotKind::Tree;

        fn validate(&mut self) -> OrganizerResult<()> {
            self.normalize();
            self.check_invariants()
        }
    }

    impl Snapshot for Pipeline {
        const KIND: SnapshotKind = SnapshotKind::Pipeline;

        fn validate(&mut self) -> OrganizerResult<()> {
            self.normalize();
            self.check_invariants()
        }
    }

    #[derive(Serialize)]
    struct EnvelopeOut<'a, T> {
        format: u32,
        kind: SnapshotKind,
        payload: &'a T,
    }

    #[derive(Deserialize)]
    struct EnvelopeIn {
        #[serde(default = "first_format")]
        format: u32,
        kind: SnapshotKind,
        payload: serde_json::Value,
    }

    fn first_format() -> u32 {
        1
    }

    pub fn encode<T: Snapshot>(value: &T) -> OrganizerResult<String> {
        serde_json::to_string(&EnvelopeOut {
            format: FORMAT_VERSION,
            kind: T::KIND,
            payload: value,
        })
        .map_err(|e| OrganizerError::CorruptSnapshot(format!("encoding {:?}: {e}", T::KIND)))
    }

    pub fn decode<T: Snapshot>(record: &str) -> OrganizerResult<T> {
        let envelope: EnvelopeIn = serde_json::from_str(record)
            .map_err(|e| OrganizerError::CorruptSnapshot(format!("envelope: {e}")))?;
        if envelope.format > FORMAT_VERSION {
            return Err(OrganizerError::CorruptSnapshot(format!(
                "format {} is newer than supported {FORMAT_VERSION}",
                envelope.format
            )));
        }
        if envelope.kind != T::KIND {
            return Err(OrganizerError::CorruptSnapshot(format!(
                "expected a {:?} snapshot, found {:?}",
                T::KIND,
                envelope.kind
            )));
        }
        let mut value: T = serde_json::from_value(envelope.payload)
            .map_err(|e| OrganizerError::CorruptSnapshot(format!("payload: {e}")))?;
        value.validate()?;
        Ok(value)
    }

    /// Decoded document, or the fallback with the reason it was needed.
    #[derive(Debug)]
    pub struct Restored<T> {
        pub value: T,
        pub notice: Option<OrganizerError>,
    }

    pub fn restore<T: Snapshot>(record: Option<&str>, fallback: impl FnOnce() -> T) -> Restored<T> {
        let Some(record) = record else {
            return Restored {
                value: fallback(),
                notice: None,
            };
        };
        match decode(record) {
            Ok(value) => Restored {
                value,
                notice: None,
            },
            Err(err) => {
                warn!(kind = ?T::KIND, %err, "snapshot unreadable; using default state");
                Restored {
                    value: fallback(),
                    notice: Some(err),
                }
            }
        }
    }

    pub fn load_tree(record: Option<&str>) -> Restored<WorkspaceTree> {
        restore(record, WorkspaceTree::new)
    }

    pub fn load_pipeline(record: Option<&str>) -> Restored<Pipeline> {
        restore(record, Pipeline::with_default_stages)
    }

}

pub mod storage {
    //! Persistence collaborators. Records are opaque strings; the format belongs to
    //! `snapshot`.

    use anyhow::{Context, Result, bail};
    use indexmap::IndexMap;
    use std::{
        cell::{Cell, RefCell},
        fs,
        io::Write,
        path::{Path, PathBuf},
    };
    use tempfile::NamedTempFile;

    pub const TREE_KEY: &str = "workspace-tree";
    pub const PIPELINE_KEY: &str = "pipeline-state";

    /// Durable key-value store the organizer mirrors its documents into.
    pub trait SnapshotStore {
        fn load(&self, key: &str) -> Result<Option<String>>;
        fn save(&self, key: &str, record: &str) -> Result<()>;
    }

    /// In-memory store that keeps every write; handy for tests and headless use.
    #[derive(Debug, Default)]
    pub struct MemoryStore {
        records: RefCell<IndexMap<String, String>>,
        writes: RefCell<Vec<(String, String)>>,
        fail_writes: Cell<bool>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_record(self, key: &str, record: &str) -> Self {
            self.records
                .borrow_mut()
                .insert(key.to_string(), record.to_string());
            self
        }

        /// Make subsequent `save` calls fail (or succeed again).
        pub fn set_failing(&self, failing: bool) {
            self.fail_writes.set(failing);
        }

        /// Every successful write, oldest first.
        pub fn writes(&self) -> Vec<(String, String)> {
            self.writes.borrow().clone()
        }

        pub fn record(&self, key: &str) -> Option<String> {
            self.records.borrow().get(key).cloned()
        }
    }

    impl SnapshotStore for MemoryStore {
        fn load(&self, key: &str) -> Result<Option<String>> {
            Ok(self.record(key))
        }

        fn save(&self, key: &str, record: &str) -> Result<()> {
            if self.fail_writes.get() {
                bail!("memory store is refusing writes");
            }
            self.records
                .borrow_mut()
                .insert(key.to_string(), record.to_string());
            self.writes
                .borrow_mut()
                .push((key.to_string(), record.to_string()));
            Ok(())
        }
    }

    /// One `<key>.json` file per key inside a directory.
    #[derive(Debug, Clone)]
    pub struct FileStore {
        dir: PathBuf,
    }

    impl FileStore {
        pub fn new(dir: impl Into<PathBuf>) -> Self {
            Self { dir: dir.into() }
        }

        pub fn dir(&self) -> &Path {
            &self.dir
        }

        fn path_for(&self, key: &str) -> Result<PathBuf> {
            if key.is_empty()
                || !key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                bail!("invalid store key {key:?}");
            }
            Ok(self.dir.join(format!("{key}.json")))
        }
    }

    impl SnapshotStore for FileStore {
        fn load(&self, key: &str) -> Result<Option<String>> {
            let path = self.path_for(key)?;
            if !path.exists() {
                return Ok(None);
            }
            fs::read_to_string(&path)
                .map(Some)
                .with_context(|| format!("reading {:?}", path))
        }

        fn save(&self, key: &str, record: &str) -> Result<()> {
            let path = self.path_for(key)?;
            fs::create_dir_all(&self.dir).with_context(|| format!("creating {:?}", self.dir))?;
            let mut temp = NamedTempFile::new_in(&self.dir)
                .with_context(|| format!("creating temp file in {:?}", self.dir))?;
            temp.write_all(record.as_bytes())
                .with_context(|| format!("writing temp file for {key}"))?;
            // Dropping the returned temp file here removes it from disk.
            temp.persist(&path)
                .map_err(|e| e.error)
                .with_context(|| format!("replacing {:?}", path))?;
            Ok(())
        }
    }

}

pub mod autosave {
    //! Debounced, fire-and-forget mirroring of documents into a `SnapshotStore`.
    //!
    //! Scheduling a key replaces any write still pending for it and restarts its quiet
    //! period, so only the latest record is ever committed. A failed write is reported and
    //! queued again unless a newer record has taken its place; the in-memory documents are
    //! never rolled back.

    use crate::core::OrganizerError;
    use crate::storage::SnapshotStore;
    use indexmap::IndexMap;
    use std::time::{Duration, Instant};
    use tracing::{debug, warn};

    #[derive(Debug, Clone)]
    struct PendingWrite {
        record: String,
        due: Instant,
    }

    /// Keys written and failures hit by one `poll` or `flush`.
    #[derive(Debug, Default, PartialEq, Eq)]
    pub struct SaveReport {
        pub written: Vec<String>,
        pub failures: Vec<OrganizerError>,
    }

    impl SaveReport {
        pub fn is_clean(&self) -> bool {
            self.failures.is_empty()
        }
    }

    #[derive(Debug, Clone)]
    pub struct Autosave {
        quiet: Duration,
        pending: IndexMap<String, PendingWrite>,
    }

    impl Autosave {
        pub fn new(quiet: Duration) -> Self {
            Self {
                quiet,
                pending: IndexMap::new(),
            }
        }

        pub fn quiet_period(&self) -> Duration {
            self.quiet
        }

        pub fn schedule(&mut self, key: &str, record: String, now: Instant) {
            let due = now + self.quiet;
            if self
                .pending
                .insert(key.to_string(), PendingWrite { record, due })
                .is_some()
            {
                debug!(key, "superseded pending write");
            }
        }

        pub fn is_pending(&self, key: &str) -> bool {
            self.pending.contains_key(key)
        }

        pub fn has_pending(&self) -> bool {
            !self.pending.is_empty()
        }

        /// Earliest instant at which `poll` has something to do.
        pub fn next_due(&self) -> Option<Instant> {
            self.pending.values().map(|p| p.due).min()
        }

        /// Commit every write whose quiet period has elapsed by `now`.
        pub fn poll<S: SnapshotStore + ?Sized>(&mut self, now: Instant, store: &S) -> SaveReport {
            let due: Vec<String> = self
                .pending
                .iter()
                .filter(|(_, p)| p.due <= now)
                .map(|(k, _)| k.clone())
                .collect();
            let mut report = SaveReport::default();
            for key in due {
                if let Some(write) = self.pending.shift_remove(&key) {
                    if !commit(store, &key, &write.record, &mut report) {
                        self.requeue(key, write.record, now + self.quiet);
                    }
                }
            }
            report
        }

        /// Commit everything pending regardless of quiet periods (shutdown, explicit save).
        /// Failed writes stay pending with their original due time.
        pub fn flush<S: SnapshotStore + ?Sized>(&mut self, store: &S) -> SaveReport {
            let mut report = SaveReport::default();
            for (key, write) in std::mem::take(&mut self.pending) {
                if !commit(store, &key, &write.record, &mut report) {
                    self.requeue(key, write.record, write.due);
                }
            }
            report
        }

        /// Put a failed record back unless a newer one has been scheduled meanwhile.
        fn requeue(&mut self, key: String, record: String, due: Instant) {
            self.pending
                .entry(key)
                .or_insert(PendingWrite { record, due });
        }
    }

    /// Returns whether the write landed.
    fn commit<S: SnapshotStore + ?Sized>(
        store: &S,
        key: &str,
        record: &str,
        report: &mut SaveReport,
    ) -> bool {
        match store.save(key, record) {
            Ok(()) => {
                debug!(key, bytes = record.len(), "snapshot saved");
                report.written.push(key.to_string());
                true
            }
            Err(e) => {
                warn!(key, error = %format!("{e:#}"), "snapshot write failed; will retry");
                report.failures.push(OrganizerError::PersistenceWriteFailed {
                    key: key.to_string(),
                    reason: format!("{e:#}"),
                });
                false
            }
        }
    }

}

pub mod engine {
    //! The organizer facade: both documents, the store they mirror into, and the autosave
    //! queue between them. Every successful mutation schedules a snapshot of the document it
    //! touched; failed ones leave both the document and the queue alone.

    use crate::autosave::{Autosave, SaveReport};
    use crate::core::{MoveOutcome, OrganizerError, OrganizerResult};
    use crate::drag::{DragSession, DropOutcome, Placement};
    use crate::pipeline::Pipeline;
    use crate::snapshot::{self, Restored, Snapshot};
    use crate::storage::{PIPELINE_KEY, SnapshotStore, TREE_KEY};
    use crate::tree::WorkspaceTree;
    use std::time::{Duration, Instant};
    use tracing::{debug, warn};

    /// The two independent documents. Only id lists inside `tree` decide ownership; only the
    /// `stage` field of a card decides stage membership.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct Documents {
        pub tree: WorkspaceTree,
        pub pipeline: Pipeline,
    }

    pub struct Organizer<S: SnapshotStore> {
        docs: Documents,
        store: S,
        autosave: Autosave,
    }

    impl<S: SnapshotStore> Organizer<S> {
        /// Load both snapshots from `store`. Missing records start from `defaults`; unreadable
        /// ones do too, and are returned as notices.
        pub fn open(store: S, quiet: Duration, defaults: Documents) -> (Self, Vec<OrganizerError>) {
            let mut notices = Vec::new();
            let Documents { tree, pipeline } = defaults;
            let tree = read(&store, TREE_KEY, tree, &mut notices);
            let pipeline = read(&store, PIPELINE_KEY, pipeline, &mut notices);
            debug!(
                spaces = tree.spaces().count(),
                cards = pipeline.cards().count(),
                "organizer opened"
            );
            let organizer = Self {
                docs: Documents { tree, pipeline },
                store,
                autosave: Autosave::new(quiet),
            };
            (organizer, notices)
        }

        pub fn documents(&self) -> &Documents {
            &self.docs
        }

        pub fn tree(&self) -> &WorkspaceTree {
            &self.docs.tree
        }

        pub fn pipeline(&self) -> &Pipeline {
            &self.docs.pipeline
        }

        pub fn store(&self) -> &S {
            &self.store
        }

        /// Run `f` against a working copy of the tree; the copy replaces the tree only when
        /// `f` succeeds, so a multi-step edit is all-or-nothing.
        pub fn edit_tree<T>(
            &mut self,
            now: Instant,
            f: impl FnOnce(&mut WorkspaceTree) -> OrganizerResult<T>,
        ) -> OrganizerResult<T> {
            let mut draft = self.docs.tree.clone();
            let out = f(&mut draft)?;
            self.docs.tree = draft;
            schedule(&mut self.autosave, TREE_KEY, &self.docs.tree, now);
            Ok(out)
        }

        pub fn edit_pipeline<T>(
            &mut self,
            now: Instant,
            f: impl FnOnce(&mut Pipeline) -> OrganizerResult<T>,
        ) -> OrganizerResult<T> {
            let mut draft = self.docs.pipeline.clone();
            let out = f(&mut draft)?;
            self.docs.pipeline = draft;
            schedule(&mut self.autosave, PIPELINE_KEY, &self.docs.pipeline, now);
            Ok(out)
        }

        /// Release `session` over its current surface. Only a drop that actually moved
        /// something is persisted.
        pub fn commit_drop(
            &mut self,
            session: &mut DragSession,
            now: Instant,
        ) -> OrganizerResult<DropOutcome> {
            let outcome = session.commit_drop(&mut self.docs)?;
            if let DropOutcome::Dropped {
                placement,
                outcome: MoveOutcome::Moved,
                ..
            } = outcome
            {
                match placement {
                    Placement::Tree { .. } => {
                        schedule(&mut self.autosave, TREE_KEY, &self.docs.tree, now)
                    }
                    Placement::Stage(_) => {
                        schedule(&mut self.autosave, PIPELINE_KEY, &self.docs.pipeline, now)
                    }
                }
            }
            Ok(outcome)
        }

        /// Commit writes whose quiet period has elapsed.
        pub fn tick(&mut self, now: Instant) -> SaveReport {
            self.autosave.poll(now, &self.store)
        }

        pub fn flush(&mut self) -> SaveReport {
            self.autosave.flush(&self.store)
        }

        pub fn has_pending_writes(&self) -> bool {
            self.autosave.has_pending()
        }

        pub fn next_save_due(&self) -> Option<Instant> {
            self.autosave.next_due()
        }
    }

    fn schedule<T: Snapshot>(autosave: &mut Autosave, key: &str, doc: &T, now: Instant) {
        match snapshot::encode(doc) {
            Ok(record) => autosave.schedule(key, record, now),
            Err(err) => warn!(key, %err, "could not encode snapshot; write skipped"),
        }
    }

    fn read<S: SnapshotStore, T: Snapshot>(
        store: &S,
        key: &str,
        fallback: T,
        notices: &mut Vec<OrganizerError>,
    ) -> T {
        let record = match store.load(key) {
            Ok(record) => record,
            Err(e) => {
                warn!(key, error = %format!("{e:#}"), "snapshot could not be read");
                notices.push(OrganizerError::CorruptSnapshot(format!("reading {key}: {e:#}")));
                return fallback;
            }
        };
        let Restored { value, notice } = snapshot::restore(record.as_deref(), || fallback);
        notices.extend(notice);
        value
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{SpaceTag, Status};
        use crate::drag::{DragItem, DropTarget};
        use crate::gate::{ConfirmationGate, SharedSecretGate};
        use crate::storage::MemoryStore;
        use crate::tree::{Locator, WorkItemPatch};
        use chrono::{DateTime, Utc};

        const QUIET: Duration = Duration::from_millis(750);

        fn stamp() -> DateTime<Utc> {
            DateTime::from_timestamp(1_700_000_000, 0).unwrap()
        }

        fn fresh() -> Organizer<MemoryStore> {
            let (org, notices) = Organizer::open(MemoryStore::new(), QUIET, Documents::default());
            assert!(notices.is_empty());
            org
        }

        #[test]
        fn edits_persist_after_quiet_period() {
            let mut org = fresh();
            let t0 = Instant::now();
            let space = org
                .edit_tree(t0, |t| t.create_space("Home", SpaceTag::default()))
                .unwrap();
            org.edit_tree(t0 + Duration::from_millis(200), |t| t.rename_space(space, "House"))
                .unwrap();

            assert!(org.tick(t0 + QUIET).written.is_empty());
            let report = org.tick(t0 + Duration::from_millis(950));
            assert_eq!(report.written, vec![TREE_KEY.to_string()]);
            assert_eq!(org.store().writes().len(), 1);

            let record = org.store().record(TREE_KEY).unwrap();
            let back: WorkspaceTree = snapshot::decode(&record).unwrap();
            assert_eq!(back.space(space).unwrap().name, "House");
        }

        #[test]
        fn failed_edit_schedules_nothing() {
            let mut org = fresh();
            let before = org.documents().clone();
            let err = org
                .edit_pipeline(Instant::now(), |p| p.move_card_to_stage(crate::core::CardId::new(), 2))
                .unwrap_err();
            assert!(matches!(err, OrganizerError::NotFound { .. }));
            assert!(!org.has_pending_writes());
            assert_eq!(org.documents(), &before);
        }

        #[test]
        fn multi_step_edit_is_all_or_nothing() {
            let mut org = fresh();
            let before = org.documents().clone();
            let result = org.edit_tree(Instant::now(), |t| {
                t.create_space("Kept?", SpaceTag::default())?;
                t.create_space("   ", SpaceTag::default())
            });
            assert!(matches!(result, Err(OrganizerError::InvalidInput(_))));
            assert_eq!(org.documents(), &before);
        }

        #[test]
        fn reopen_restores_both_documents() {
            let mut org = fresh();
            let t0 = Instant::now();
            let item = org
                .edit_tree(t0, |t| {
                    let space = t.create_space("Work", SpaceTag::default())?;
                    let list = t.create_collection(&Locator::SpaceCollections { space }, "Inbox", None)?;
                    let at = Locator::CollectionItems {
                        space,
                        group: None,
                        collection: list,
                    };
                    let item = t.create_item(&at, "Ship", stamp(), None)?;
                    t.update_item(
                        item,
                        WorkItemPatch {
                            status: Some(Status::Blocked),
                            ..WorkItemPatch::default()
                        },
                        stamp(),
                    )?;
                    Ok(item)
                })
                .unwrap();
            let card = org
                .edit_pipeline(t0, |p| p.create_card("shop.test", 5, stamp()))
                .unwrap();
            assert!(org.flush().is_clean());

            let store = MemoryStore::new()
                .with_record(TREE_KEY, &org.store().record(TREE_KEY).unwrap())
                .with_record(PIPELINE_KEY, &org.store().record(PIPELINE_KEY).unwrap());
            let (again, notices) = Organizer::open(store, QUIET, Documents::default());
            assert!(notices.is_empty());
            assert_eq!(again.tree().item(item).unwrap().status, Status::Blocked);
            assert_eq!(again.pipeline().card(card).unwrap().stage, 5);
        }

        #[test]
        fn corrupt_record_opens_with_defaults_and_notice() {
            let store = MemoryStore::new().with_record(PIPELINE_KEY, "[1,2,");
            let (org, notices) = Organizer::open(store, QUIET, Documents::default());
            assert_eq!(notices.len(), 1);
            assert!(matches!(notices[0], OrganizerError::CorruptSnapshot(_)));
            assert_eq!(org.pipeline(), &Pipeline::with_default_stages());
        }

        #[test]
        fn only_moving_drops_are_persisted() {
            let mut org = fresh();
            let t0 = Instant::now();
            let card = org
                .edit_pipeline(t0, |p| p.create_card("a.test", 1, stamp()))
                .unwrap();
            org.flush();

            let mut session = DragSession::new();
            session.begin(DragItem::Card(card), org.documents()).unwrap();
            session.hover(DropTarget::Stage(1), org.documents());
            assert_eq!(org.commit_drop(&mut session, t0).unwrap(), DropOutcome::Cancelled);
            assert!(!org.has_pending_writes());

            session.begin(DragItem::Card(card), org.documents()).unwrap();
            session.hover(DropTarget::Stage(2), org.documents());
            org.commit_drop(&mut session, t0).unwrap();
            assert!(org.has_pending_writes());
            assert_eq!(org.pipeline().card(card).unwrap().stage, 2);
        }

        #[test]
        fn failing_store_keeps_model() {
            let mut org = fresh();
            org.store().set_failing(true);
            let auth = SharedSecretGate::new("yes").confirm("yes").unwrap();
            let t0 = Instant::now();
            org.edit_pipeline(t0, |p| p.delete_stage(16, &auth)).unwrap();
            let report = org.tick(t0 + QUIET);
            assert_eq!(report.failures.len(), 1);
            assert_eq!(org.pipeline().stage_count(), 15);
            assert!(org.has_pending_writes());

            org.store().set_failing(false);
            assert!(org.flush().is_clean());
            let record = org.store().record(PIPELINE_KEY).unwrap();
            let saved: Pipeline = snapshot::decode(&record).unwrap();
            assert_eq!(saved.stage_count(), 15);
        }
    }
}

pub mod views {
    //! Read-only projections for the presentation layer. Everything here is computed on
    //! demand from the current documents and returns owned values.

    use crate::core::*;
    use crate::pipeline::Pipeline;
    use crate::tree::{Locator, Node, WorkspaceTree};
    use chrono::{DateTime, Utc};
    use serde::Serialize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum SortKey {
        #[default]
        Position,
        Title,
        Created,
    }

    /// Filter and ordering applied to item lists.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct ItemQuery {
        /// Case-insensitive substring match on names (and card field values).
        pub text: Option<String>,
        /// Cards only; tree nodes have no archived state.
        pub include_archived: bool,
        pub sort: SortKey,
    }

    impl ItemQuery {
        fn matches<'a>(&self, haystacks: impl IntoIterator<Item = &'a str>) -> bool {
            let Some(needle) = self.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
                return true;
            };
            let needle = needle.to_lowercase();
            haystacks
                .into_iter()
                .any(|h| h.to_lowercase().contains(&needle))
        }
    }

    /// One row of a container listing.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct EntryView {
        pub node: Node,
        /// Index inside the container, independent of the requested sort.
        pub position: usize,
        pub name: String,
        pub open: Option<bool>,
        pub children: usize,
        pub status: Option<Status>,
        pub progress: Option<Progress>,
        #[serde(skip)]
        created_at: Option<DateTime<Utc>>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct CardView {
        pub id: CardId,
        pub name: String,
        pub stage: u32,
        pub archived: bool,
        pub created_at: DateTime<Utc>,
        pub progress: Progress,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct StageColumn {
        pub number: u32,
        pub title: String,
        pub short_title: String,
        pub count: usize,
        pub cards: Vec<CardView>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct SpaceSummary {
        pub id: SpaceId,
        pub name: String,
        pub color: String,
        pub icon: Option<String>,
        pub open: bool,
        pub groups: usize,
        pub collections: usize,
        pub items: usize,
    }

    /* ------------------------------- Tree ------------------------------- */

    pub fn count_in(tree: &WorkspaceTree, at: &Locator) -> OrganizerResult<usize> {
        Ok(tree.container(at)?.len())
    }

    pub fn items_in(
        tree: &WorkspaceTree,
        at: &Locator,
        query: &ItemQuery,
    ) -> OrganizerResult<Vec<EntryView>> {
        let mut rows = Vec::new();
        for (position, node) in tree.container(at)?.nodes().into_iter().enumerate() {
            let row = entry(tree, node, position)?;
            if query.matches([row.name.as_str()]) {
                rows.push(row);
            }
        }
        match query.sort {
            SortKey::Position => {}
            SortKey::Title => rows.sort_by_key(|r| r.name.to_lowercase()),
            SortKey::Created => rows.sort_by_key(|r| r.created_at),
        }
        Ok(rows)
    }

    /// Subtask completion summed over every work item under `at`.
    pub fn subtask_progress(tree: &WorkspaceTree, at: &Locator) -> OrganizerResult<Progress> {
        let mut total = Progress::default();
        for node in tree.container(at)?.nodes() {
            let p = node_progress(tree, node)?;
            total.done += p.done;
            total.total += p.total;
        }
        Ok(total)
    }

    pub fn space_summaries(tree: &WorkspaceTree) -> Vec<SpaceSummary> {
        tree.spaces()
            .map(|space| {
                let collections: Vec<CollectionId> = space
                    .collections
                    .iter()
                    .chain(
                        space
                            .groups
                            .iter()
                            .filter_map(|g| tree.group(g).ok())
                            .flat_map(|g| g.collections.iter()),
                    )
                    .collect();
                let items = collections
                    .iter()
                    .filter_map(|c| tree.collection(*c).ok())
                    .map(|c| c.items.len())
                    .sum();
                SpaceSummary {
                    id: space.id,
                    name: space.name.clone(),
                    color: space.tag.color.clone(),
                    icon: space.tag.icon.clone(),
                    open: space.open,
                    groups: space.groups.len(),
                    collections: collections.len(),
                    items,
                }
            })
            .collect()
    }

    fn entry(tree: &WorkspaceTree, node: Node, position: usize) -> OrganizerResult<EntryView> {
        Ok(match node {
            Node::Group(id) => {
                let group = tree.group(id)?;
                EntryView {
                    node,
                    position,
                    name: group.name.clone(),
                    open: Some(group.open),
                    children: group.collections.len(),
                    status: None,
                    progress: None,
                    created_at: None,
                }
            }
            Node::Collection(id) => {
                let collection = tree.collection(id)?;
                EntryView {
                    node,
                    position,
                    name: collection.name.clone(),
                    open: None,
                    children: collection.items.len(),
                    status: None,
                    progress: Some(node_progress(tree, node)?),
                    created_at: None,
                }
            }
            Node::WorkItem(id) => {
                let item = tree.item(id)?;
                EntryView {
                    node,
                    position,
                    name: item.title.clone(),
                    open: None,
                    children: item.subtasks.len(),
                    status: Some(item.status),
                    progress: Some(item.subtasks.progress()),
                    created_at: item.meta.created_at,
                }
            }
        })
    }

    fn node_progress(tree: &WorkspaceTree, node: Node) -> OrganizerResult<Progress> {
        match node {
            Node::WorkItem(id) => Ok(tree.item(id)?.subtasks.progress()),
            Node::Collection(id) => {
                let mut total = Progress::default();
                for item in tree.collection(id)?.items.iter() {
                    let p = tree.item(item)?.subtasks.progress();
                    total.done += p.done;
                    total.total += p.total;
                }
                Ok(total)
            }
            Node::Group(id) => {
                let mut total = Progress::default();
                for c in tree.group(id)?.collections.iter() {
                    let p = node_progress(tree, Node::Collection(c))?;
                    total.done += p.done;
                    total.total += p.total;
                }
                Ok(total)
            }
        }
    }

    /* ----------------------------- Pipeline ----------------------------- */

    /// Cards whose stage reference is `number`, in creation order unless sorted otherwise.
    pub fn items_at_stage(
        pipeline: &Pipeline,
        number: u32,
        query: &ItemQuery,
    ) -> OrganizerResult<Vec<CardView>> {
        pipeline.stage(number)?;
        let mut cards: Vec<CardView> = pipeline
            .cards()
            .filter(|c| c.stage == number)
            .filter(|c| query.include_archived || !c.archived)
            .filter(|c| {
                query.matches(std::iter::once(c.name.as_str()).chain(c.fields.values().map(String::as_str)))
            })
            .map(card_view)
            .collect();
        match query.sort {
            SortKey::Position => {}
            SortKey::Title => cards.sort_by_key(|c| c.name.to_lowercase()),
            SortKey::Created => cards.sort_by_key(|c| c.created_at),
        }
        Ok(cards)
    }

    /// The board: one column per stage, in stage order.
    pub fn stage_columns(pipeline: &Pipeline, query: &ItemQuery) -> Vec<StageColumn> {
        pipeline
            .stages()
            .iter()
            .map(|stage| {
                let cards = items_at_stage(pipeline, stage.number, query).unwrap_or_default();
                StageColumn {
                    number: stage.number,
                    title: stage.title.clone(),
                    short_title: stage.short_title.clone(),
                    count: cards.len(),
                    cards,
                }
            })
            .collect()
    }

    fn card_view(card: &Card) -> CardView {
        CardView {
            id: card.id,
            name: card.name.clone(),
            stage: card.stage,
            archived: card.archived,
            created_at: card.created_at,
            progress: card.subtasks.progress(),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::gate::{ConfirmationGate, SharedSecretGate};

        fn at(secs: i64) -> DateTime<Utc> {
            DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
        }

        #[test]
        fn listing_follows_container_order_and_sorts_on_request() {
            let mut tree = WorkspaceTree::new();
            let space = tree.create_space("S", SpaceTag::default()).unwrap();
            let list = tree
                .create_collection(&Locator::SpaceCollections { space }, "L", None)
                .unwrap();
            let loc = tree.items_locator(list).unwrap();
            tree.create_item(&loc, "charlie", at(0), None).unwrap();
            tree.create_item(&loc, "Alpha", at(20), None).unwrap();
            let bravo = tree.create_item(&loc, "bravo", at(10), Some(0)).unwrap();
            tree.edit_subtasks(bravo, at(30), |s| {
                let a = s.add("a")?;
                s.add("b")?;
                s.toggle(a)
            })
            .unwrap();

            let names = |q: &ItemQuery| -> Vec<String> {
                items_in(&tree, &loc, q).unwrap().into_iter().map(|r| r.name).collect()
            };
            assert_eq!(names(&ItemQuery::default()), ["bravo", "charlie", "Alpha"]);
            let by_title = ItemQuery {
                sort: SortKey::Title,
                ..ItemQuery::default()
            };
            assert_eq!(names(&by_title), ["Alpha", "bravo", "charlie"]);
            let by_created = ItemQuery {
                sort: SortKey::Created,
                ..ItemQuery::default()
            };
            assert_eq!(names(&by_created), ["charlie", "bravo", "Alpha"]);
            let filtered = ItemQuery {
                text: Some("AL".into()),
                ..ItemQuery::default()
            };
            assert_eq!(names(&filtered), ["Alpha"]);

            assert_eq!(count_in(&tree, &loc).unwrap(), 3);
            assert_eq!(
                subtask_progress(&tree, &Locator::SpaceCollections { space }).unwrap(),
                Progress { done: 1, total: 2 }
            );
        }

        #[test]
        fn views_track_moves_immediately() {
            let mut tree = WorkspaceTree::new();
            let s1 = tree.create_space("One", SpaceTag::default()).unwrap();
            let s2 = tree.create_space("Two", SpaceTag::default()).unwrap();
            let group = tree.create_group(s1, "G", None).unwrap();
            let from = Locator::GroupCollections { space: s1, group };
            let list = tree.create_collection(&from, "L", None).unwrap();
            let to = Locator::SpaceCollections { space: s2 };
            tree.move_node(Node::Collection(list), &from, &to, 0).unwrap();

            assert_eq!(count_in(&tree, &from).unwrap(), 0);
            let rows = items_in(&tree, &to, &ItemQuery::default()).unwrap();
            assert_eq!(rows[0].node, Node::Collection(list));
            let summaries = space_summaries(&tree);
            assert_eq!(summaries[0].collections, 0);
            assert_eq!(summaries[1].collections, 1);
        }

        #[test]
        fn stage_lists_filter_by_reference() {
            let mut p = Pipeline::with_default_stages();
            let auth = SharedSecretGate::new("k").confirm("k").unwrap();
            let a = p.create_card("alpha.test", 2, at(0)).unwrap();
            let b = p.create_card("beta.test", 2, at(5)).unwrap();
            p.create_card("gamma.test", 3, at(0)).unwrap();
            p.set_field(b, "client", "Zephyr").unwrap();
            p.archive_card(a, &auth).unwrap();

            let visible = items_at_stage(&p, 2, &ItemQuery::default()).unwrap();
            assert_eq!(visible.len(), 1);
            assert_eq!(visible[0].id, b);

            let all = ItemQuery {
                include_archived: true,
                ..ItemQuery::default()
            };
            assert_eq!(items_at_stage(&p, 2, &all).unwrap().len(), 2);

            let by_field = ItemQuery {
                text: Some("zeph".into()),
                ..ItemQuery::default()
            };
            assert_eq!(items_at_stage(&p, 2, &by_field).unwrap()[0].id, b);

            assert!(matches!(
                items_at_stage(&p, 99, &ItemQuery::default()),
                Err(OrganizerError::NotFound { .. })
            ));

            let columns = stage_columns(&p, &ItemQuery::default());
            assert_eq!(columns.len(), 16);
            assert_eq!(columns[1].count, 1);
            assert_eq!(columns[2].count, 1);
        }
    }
}

pub mod syntax {
    //! Text form of locators and drag items, used by the CLI and in log lines.
    //!
    //! ```text
    //! space/<id>                               root collections of a space
    //! space/<id>/groups                        groups of a space
    //! space/<id>/group/<id>                    collections of a group
    //! space/<id>[/group/<id>]/collection/<id>  items of a collection
    //! item:<id> | collection:<id> | group:<id> | card:<id>
    //! ```

    use crate::core::*;
    use crate::drag::DragItem;
    use crate::tree::Locator;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while1},
        combinator::{all_consuming, eof, map, map_res, opt},
        error::VerboseError,
        sequence::{pair, preceded},
    };
    use std::{fmt, str::FromStr};
    use uuid::Uuid;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    pub fn parse_locator(input: &str) -> OrganizerResult<Locator> {
        all_consuming(locator)(input.trim())
            .map(|(_, loc)| loc)
            .map_err(to_error("locator", input))
    }

    pub fn parse_drag_item(input: &str) -> OrganizerResult<DragItem> {
        all_consuming(drag_item)(input.trim())
            .map(|(_, item)| item)
            .map_err(to_error("item reference", input))
    }

    fn to_error<'a>(
        label: &'static str,
        input: &'a str,
    ) -> impl Fn(nom::Err<VerboseError<&'a str>>) -> OrganizerError + 'a {
        move |e| {
            let at = match &e {
                nom::Err::Error(ve) | nom::Err::Failure(ve) => {
                    ve.errors.first().map(|(frag, _)| *frag).unwrap_or(input)
                }
                nom::Err::Incomplete(_) => "",
            };
            OrganizerError::InvalidInput(format!("bad {label} {input:?} near {at:?}"))
        }
    }

    fn uuid(i: &str) -> PResult<'_, Uuid> {
        map_res(
            take_while1(|c: char| c.is_ascii_hexdigit() || c == '-'),
            Uuid::parse_str,
        )(i)
    }

    fn locator(i: &str) -> PResult<'_, Locator> {
        let (i, space) = preceded(tag("space/"), map(uuid, SpaceId))(i)?;
        alt((
            map(tag("/groups"), move |_| Locator::SpaceGroups { space }),
            map(
                pair(
                    preceded(tag("/group/"), map(uuid, GroupId)),
                    opt(preceded(tag("/collection/"), map(uuid, CollectionId))),
                ),
                move |(group, collection)| match collection {
                    Some(collection) => Locator::CollectionItems {
                        space,
                        group: Some(group),
                        collection,
                    },
                    None => Locator::GroupCollections { space, group },
                },
            ),
            map(
                preceded(tag("/collection/"), map(uuid, CollectionId)),
                move |collection| Locator::CollectionItems {
                    space,
                    group: None,
                    collection,
                },
            ),
            map(eof, move |_| Locator::SpaceCollections { space }),
        ))(i)
    }

    fn drag_item(i: &str) -> PResult<'_, DragItem> {
        alt((
            map(preceded(tag("item:"), uuid), |u| DragItem::WorkItem(WorkItemId(u))),
            map(preceded(tag("collection:"), uuid), |u| {
                DragItem::Collection(CollectionId(u))
            }),
            map(preceded(tag("group:"), uuid), |u| DragItem::Group(GroupId(u))),
            map(preceded(tag("card:"), uuid), |u| DragItem::Card(CardId(u))),
        ))(i)
    }

    impl fmt::Display for Locator {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Locator::SpaceGroups { space } => write!(f, "space/{space}/groups"),
                Locator::SpaceCollections { space } => write!(f, "space/{space}"),
                Locator::GroupCollections { space, group } => {
                    write!(f, "space/{space}/group/{group}")
                }
                Locator::CollectionItems {
                    space,
                    group,
                    collection,
                } => {
                    write!(f, "space/{space}")?;
                    if let Some(group) = group {
                        write!(f, "/group/{group}")?;
                    }
                    write!(f, "/collection/{collection}")
                }
            }
        }
    }

    impl FromStr for Locator {
        type Err = OrganizerError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            parse_locator(s)
        }
    }

    impl fmt::Display for DragItem {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                DragItem::WorkItem(id) => write!(f, "item:{id}"),
                DragItem::Collection(id) => write!(f, "collection:{id}"),
                DragItem::Group(id) => write!(f, "group:{id}"),
                DragItem::Card(id) => write!(f, "card:{id}"),
            }
        }
    }

    impl FromStr for DragItem {
        type Err = OrganizerError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            parse_drag_item(s)
        }
    }

}

pub mod config {
    //! Runtime settings: built-in defaults, then a TOML file, then `ORGANIZER_*` variables.

    use crate::engine::Documents;
    use crate::gate::{ConfirmationGate, DenyAllGate, SharedSecretGate};
    use crate::pipeline::Pipeline;
    use crate::tree::WorkspaceTree;
    use anyhow::{Context, Result, bail};
    use serde::{Deserialize, Serialize};
    use serde_with::skip_serializing_none;
    use std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    };
    use tracing::warn;

    const APP_DIR: &str = "organizer";

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StageTemplate {
        pub title: String,
        #[serde(default)]
        pub short_title: String,
    }

    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct OrganizerConfig {
        /// Where snapshot records live; defaults to the platform data dir.
        pub store_dir: Option<PathBuf>,
        pub autosave_quiet_ms: u64,
        pub log_level: String,
        /// Token that authorizes stage deletion and archiving. Unset disables both.
        pub confirmation_secret: Option<String>,
        pub default_stages: Option<Vec<StageTemplate>>,
    }

    impl Default for OrganizerConfig {
        fn default() -> Self {
            Self {
                store_dir: None,
                autosave_quiet_ms: 750,
                log_level: "info".to_string(),
                confirmation_secret: None,
                default_stages: None,
            }
        }
    }

    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"))
    }

    impl OrganizerConfig {
        pub fn from_toml_str(text: &str) -> Result<Self> {
            toml::from_str(text).context("parsing organizer config")
        }

        /// Read `explicit` (which must exist) or the default path (which may not), then apply
        /// the process environment.
        pub fn load(explicit: Option<&Path>) -> Result<Self> {
            let mut config = match explicit {
                Some(path) => Self::read_file(path)?,
                None => match default_config_path() {
                    Some(path) if path.exists() => Self::read_file(&path)?,
                    _ => Self::default(),
                },
            };
            config.apply_env_overrides(|key| std::env::var(key).ok());
            Ok(config)
        }

        fn read_file(path: &Path) -> Result<Self> {
            let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            Self::from_toml_str(&text).with_context(|| format!("in {:?}", path))
        }

        /// Overlay `ORGANIZER_*` values from `lookup`. Unparsable values are ignored with a
        /// warning.
        pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
            let get = |key: &str| {
                lookup(key)
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
            };
            if let Some(dir) = get("ORGANIZER_STORE_DIR") {
                self.store_dir = Some(PathBuf::from(dir));
            }
            if let Some(raw) = get("ORGANIZER_AUTOSAVE_MS") {
                match raw.parse::<u64>() {
                    Ok(ms) => self.autosave_quiet_ms = ms,
                    Err(err) => warn!("invalid ORGANIZER_AUTOSAVE_MS, ignoring: {err}"),
                }
            }
            if let Some(level) = get("ORGANIZER_LOG") {
                self.log_level = level;
            }
            if let Some(secret) = get("ORGANIZER_SECRET") {
                self.confirmation_secret = Some(secret);
            }
        }

        pub fn autosave_quiet(&self) -> Duration {
            Duration::from_millis(self.autosave_quiet_ms)
        }

        pub fn store_dir(&self) -> Result<PathBuf> {
            if let Some(dir) = &self.store_dir {
                return Ok(dir.clone());
            }
            match dirs::data_dir() {
                Some(data) => Ok(data.join(APP_DIR)),
                None => bail!("no data directory on this platform; set store_dir"),
            }
        }

        pub fn gate(&self) -> Box<dyn ConfirmationGate> {
            match self.confirmation_secret.as_deref() {
                Some(secret) if !secret.is_empty() => Box::new(SharedSecretGate::new(secret)),
                _ => Box::new(DenyAllGate),
            }
        }

        pub fn initial_pipeline(&self) -> Result<Pipeline> {
            match &self.default_stages {
                None => Ok(Pipeline::with_default_stages()),
                Some(stages) => Pipeline::from_titles(
                    stages
                        .iter()
                        .map(|s| (s.title.clone(), s.short_title.clone())),
                )
                .context("default_stages"),
            }
        }

        /// Documents used when the store holds no (readable) snapshot.
        pub fn initial_documents(&self) -> Result<Documents> {
            Ok(Documents {
                tree: WorkspaceTree::new(),
                pipeline: self.initial_pipeline()?,
            })
        }
    }

}
