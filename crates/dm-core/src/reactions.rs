use std::collections::BTreeMap;

use crate::types::{Reaction, ReactionGroup};

/// What a toggle on `(message, user, emoji)` should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionToggle {
    Add,
    Remove,
}

/// Group a message's reactions by emoji.
///
/// Users appear in arrival order; a reaction without a display name falls
/// back to the user id.
pub fn group_reactions(reactions: &[Reaction]) -> BTreeMap<String, ReactionGroup> {
    let mut groups: BTreeMap<String, ReactionGroup> = BTreeMap::new();

    for reaction in reactions {
        let group = groups
            .entry(reaction.emoji.clone())
            .or_insert_with(|| ReactionGroup {
                emoji: reaction.emoji.clone(),
                count: 0,
                user_ids: Vec::new(),
                user_names: Vec::new(),
            });
        if group.includes(&reaction.user_id) {
            continue;
        }
        group.count += 1;
        group.user_ids.push(reaction.user_id.clone());
        group.user_names.push(
            reaction
                .user_name
                .clone()
                .unwrap_or_else(|| reaction.user_id.clone()),
        );
    }

    groups
}

/// Groups in display order: most used first, ties by emoji.
pub fn ordered_groups(reactions: &[Reaction]) -> Vec<ReactionGroup> {
    let mut groups: Vec<_> = group_reactions(reactions).into_values().collect();
    groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.emoji.cmp(&b.emoji)));
    groups
}

pub fn toggle_action(reactions: &[Reaction], user_id: &str, emoji: &str) -> ReactionToggle {
    if reactions
        .iter()
        .any(|reaction| reaction.user_id == user_id && reaction.emoji == emoji)
    {
        ReactionToggle::Remove
    } else {
        ReactionToggle::Add
    }
}
