//! In-process store backend for tests and local development

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::{ChannelId, RoomId, ThreadId, UserId};

use super::{GatewayStore, RoomAccess, StoreError};

#[derive(Default)]
struct Tables {
    rooms: HashMap<RoomId, (UserId, bool)>,
    channels: HashMap<ChannelId, RoomId>,
    members: HashSet<(RoomId, UserId)>,
    bans: HashSet<(RoomId, UserId)>,
    threads: HashMap<ThreadId, (UserId, UserId)>,
    friendships: HashSet<(UserId, UserId)>,
}

/// Memory-backed [`GatewayStore`].
///
/// `set_unavailable(true)` makes every query fail, which is how tests
/// exercise the transient-error path.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_room(&self, room_id: RoomId, owner_id: UserId, is_public: bool) {
        self.tables.write().rooms.insert(room_id, (owner_id, is_public));
    }

    pub fn add_channel(&self, channel_id: ChannelId, room_id: RoomId) {
        self.tables.write().channels.insert(channel_id, room_id);
    }

    pub fn add_member(&self, room_id: RoomId, user_id: UserId) {
        self.tables.write().members.insert((room_id, user_id));
    }

    pub fn remove_member(&self, room_id: RoomId, user_id: UserId) {
        self.tables.write().members.remove(&(room_id, user_id));
    }

    pub fn ban(&self, room_id: RoomId, user_id: UserId) {
        let mut tables = self.tables.write();
        tables.members.remove(&(room_id, user_id));
        tables.bans.insert((room_id, user_id));
    }

    pub fn unban(&self, room_id: RoomId, user_id: UserId) {
        self.tables.write().bans.remove(&(room_id, user_id));
    }

    pub fn add_dm_thread(&self, thread_id: ThreadId, a: UserId, b: UserId) {
        self.tables.write().threads.insert(thread_id, (a, b));
    }

    pub fn befriend(&self, a: UserId, b: UserId) {
        self.tables.write().friendships.insert(ordered(a, b));
    }

    pub fn unfriend(&self, a: UserId, b: UserId) {
        self.tables.write().friendships.remove(&ordered(a, b));
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

fn ordered(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn channel_room(&self, channel_id: ChannelId) -> Result<Option<RoomAccess>, StoreError> {
        self.check_available()?;
        let tables = self.tables.read();
        Ok(tables.channels.get(&channel_id).and_then(|room_id| {
            tables
                .rooms
                .get(room_id)
                .map(|(owner_id, is_public)| RoomAccess {
                    room_id: *room_id,
                    owner_id: *owner_id,
                    is_public: *is_public,
                })
        }))
    }

    async fn is_room_banned(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.tables.read().bans.contains(&(room_id, user_id)))
    }

    async fn is_room_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.tables.read().members.contains(&(room_id, user_id)))
    }

    async fn dm_thread_members(
        &self,
        thread_id: ThreadId,
    ) -> Result<Option<(UserId, UserId)>, StoreError> {
        self.check_available()?;
        Ok(self.tables.read().threads.get(&thread_id).copied())
    }

    async fn are_friends(&self, a: UserId, b: UserId) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.tables.read().friendships.contains(&ordered(a, b)))
    }

    async fn room_channel_ids(&self, room_id: RoomId) -> Result<Vec<ChannelId>, StoreError> {
        self.check_available()?;
        let tables = self.tables.read();
        let mut ids: Vec<ChannelId> = tables
            .channels
            .iter()
            .filter(|(_, r)| **r == room_id)
            .map(|(c, _)| *c)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn rooms_for_user(&self, user_id: UserId) -> Result<Vec<RoomId>, StoreError> {
        self.check_available()?;
        let tables = self.tables.read();
        let mut ids: HashSet<RoomId> = tables
            .rooms
            .iter()
            .filter(|(_, (owner, _))| *owner == user_id)
            .map(|(r, _)| *r)
            .collect();
        ids.extend(
            tables
                .members
                .iter()
                .filter(|(_, u)| *u == user_id)
                .map(|(r, _)| *r),
        );
        let mut ids: Vec<RoomId> = ids.into_iter().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }

    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_room_lookup() {
        let store = MemoryStore::new();
        store.add_room(1, 10, false);
        store.add_channel(100, 1);

        let access = store.channel_room(100).await.unwrap().unwrap();
        assert_eq!(access.room_id, 1);
        assert_eq!(access.owner_id, 10);
        assert!(!access.is_public);

        assert!(store.channel_room(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rooms_for_user_includes_owned_and_joined() {
        let store = MemoryStore::new();
        store.add_room(1, 10, false);
        store.add_room(2, 20, true);
        store.add_room(3, 30, true);
        store.add_member(2, 10);

        assert_eq!(store.rooms_for_user(10).await.unwrap(), vec![1, 2]);
        assert!(store.rooms_for_user(99).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_friendship_is_symmetric() {
        let store = MemoryStore::new();
        store.befriend(2, 1);

        assert!(store.are_friends(1, 2).await.unwrap());
        assert!(store.are_friends(2, 1).await.unwrap());

        store.unfriend(1, 2);
        assert!(!store.are_friends(2, 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_ban_drops_membership() {
        let store = MemoryStore::new();
        store.add_room(1, 10, false);
        store.add_member(1, 5);
        store.ban(1, 5);

        assert!(store.is_room_banned(1, 5).await.unwrap());
        assert!(!store.is_room_member(1, 5).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_fails_queries() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        assert!(matches!(
            store.channel_room(1).await,
            Err(StoreError::Unavailable)
        ));
    }
}
