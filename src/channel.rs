use crate::proto::mumble::ChannelState;
use std::collections::HashMap;

pub const ROOT_CHANNEL_ID: u32 = 0;

pub struct Channel {
    pub id: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub description: String,
    pub temporary: bool,
    pub position: i32,
    /// Session of the client that created a temporary channel.
    pub creator: Option<u32>,
}

impl Channel {
    pub fn new(id: u32, parent: Option<u32>, name: String, description: String, temporary: bool) -> Self {
        Self {
            id,
            parent,
            name,
            description,
            temporary,
            position: 0,
            creator: None,
        }
    }

    pub fn root() -> Self {
        Channel::new(ROOT_CHANNEL_ID, None, "Root".to_string(), "Root channel".to_string(), false)
    }

    pub fn get_channel_state(&self) -> ChannelState {
        let mut channel_state = ChannelState::new();
        channel_state.set_channel_id(self.id);

        if let Some(parent) = self.parent {
            channel_state.set_parent(parent);
        }

        channel_state.set_name(self.name.clone());
        channel_state.set_description(self.description.clone());
        channel_state.set_temporary(self.temporary);
        channel_state.set_position(self.position);

        channel_state
    }
}

/// True when reparenting `channel_id` under `new_parent` would close a loop
/// in the tree. Walks the parent chain of the proposed parent; meeting the
/// moved channel on the way up means the move is illegal.
pub fn would_create_cycle(channels: &HashMap<u32, Channel>, channel_id: u32, new_parent: u32) -> bool {
    let mut cursor = Some(new_parent);
    let mut hops = 0;

    while let Some(id) = cursor {
        if id == channel_id {
            return true;
        }

        hops += 1;

        if hops > channels.len() {
            // Broken chain, treat as illegal rather than walking forever.
            return true;
        }

        cursor = channels.get(&id).and_then(|channel| channel.parent);
    }

    false
}

/// The channel and every descendant, for tree-addressed messages.
pub fn subtree(channels: &HashMap<u32, Channel>, root: u32) -> Vec<u32> {
    let mut members = vec![root];
    let mut cursor = 0;

    while cursor < members.len() {
        let parent = members[cursor];
        cursor += 1;

        for channel in channels.values() {
            if channel.parent == Some(parent) && !members.contains(&channel.id) {
                members.push(channel.id);
            }
        }
    }

    members
}

/// Channel ids ordered for a sync: root first, every parent before its
/// children, siblings by sort position then id.
pub fn tree_order(channels: &HashMap<u32, Channel>) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();

    for channel in channels.values() {
        if let Some(parent) = channel.parent {
            children.entry(parent).or_default().push(channel.id);
        }
    }

    for siblings in children.values_mut() {
        siblings.sort_by_key(|id| (channels[id].position, *id));
    }

    let mut order = Vec::with_capacity(channels.len());
    let mut queue = std::collections::VecDeque::from([ROOT_CHANNEL_ID]);

    while let Some(id) = queue.pop_front() {
        if !channels.contains_key(&id) {
            continue;
        }

        order.push(id);

        if let Some(siblings) = children.get(&id) {
            queue.extend(siblings.iter().copied());
        }
    }

    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> HashMap<u32, Channel> {
        let mut channels = HashMap::new();
        channels.insert(0, Channel::root());
        channels.insert(1, Channel::new(1, Some(0), "a".into(), String::new(), false));
        channels.insert(2, Channel::new(2, Some(1), "b".into(), String::new(), false));
        channels.insert(3, Channel::new(3, Some(2), "c".into(), String::new(), true));

        channels
    }

    #[test]
    fn move_under_own_descendant_is_a_cycle() {
        let channels = tree();

        assert!(would_create_cycle(&channels, 1, 3));
        assert!(would_create_cycle(&channels, 1, 1));
        assert!(!would_create_cycle(&channels, 3, 0));
        assert!(!would_create_cycle(&channels, 3, 1));
    }

    #[test]
    fn order_is_root_first_parents_before_children() {
        let channels = tree();
        let order = tree_order(&channels);

        assert_eq!(order[0], ROOT_CHANNEL_ID);

        let position = |id: u32| order.iter().position(|&c| c == id).unwrap();
        assert!(position(1) < position(2));
        assert!(position(2) < position(3));
    }

    #[test]
    fn subtree_covers_descendants_only() {
        let channels = tree();

        let mut members = subtree(&channels, 1);
        members.sort_unstable();
        assert_eq!(members, vec![1, 2, 3]);

        assert_eq!(subtree(&channels, 3), vec![3]);
    }

    #[test]
    fn siblings_follow_sort_position() {
        let mut channels = HashMap::new();
        channels.insert(0, Channel::root());

        let mut first = Channel::new(5, Some(0), "late".into(), String::new(), false);
        first.position = 10;
        channels.insert(5, first);

        let mut second = Channel::new(9, Some(0), "early".into(), String::new(), false);
        second.position = -1;
        channels.insert(9, second);

        assert_eq!(tree_order(&channels), vec![0, 9, 5]);
    }
}
