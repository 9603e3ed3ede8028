use crate::{
    dao::models::{LeaderboardSize, ranking_order},
    dto::ws::LeaderboardEntry,
};

/// Score line of one participant, borrowed from the controller roster.
#[derive(Debug, Clone, Copy)]
pub struct Standing<'a> {
    pub user_id: &'a str,
    pub name: &'a str,
    pub emoji: Option<&'a str>,
    pub marks: f64,
}

/// Order by marks (highest first) then name, number from 1 and keep the top `size`.
pub fn rank<'a>(
    standings: impl IntoIterator<Item = Standing<'a>>,
    size: LeaderboardSize,
) -> Vec<LeaderboardEntry> {
    let mut standings: Vec<Standing<'a>> = standings.into_iter().collect();
    standings.sort_by(|a, b| ranking_order(a.marks, a.name, b.marks, b.name));
    if let Some(limit) = size.limit() {
        standings.truncate(limit);
    }

    standings
        .into_iter()
        .zip(1..)
        .map(|(standing, rank)| LeaderboardEntry {
            rank,
            user_id: Some(standing.user_id.to_owned()),
            name: standing.name.to_owned(),
            emoji: standing.emoji.map(str::to_owned),
            marks: standing.marks,
        })
        .collect()
}
