//! Placeholder community data
//!
//! Produces channels (kind 40), channel posts (kind 42) and notes (kind 1)
//! for demos and end-to-end runs. Event ids are content-addressed: the
//! SHA-256 of the compact JSON `[0, pubkey, created_at, kind, tags, content]`.
//! That id is NOT a cryptographic identity. Pubkeys are hashes of seeded
//! random bytes and every signature is a zero placeholder.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::builder::TextDocument;

pub const KIND_NOTE: u16 = 1;
pub const KIND_CHANNEL: u16 = 40;
pub const KIND_CHANNEL_POST: u16 = 42;

const USERS: usize = 20;
const MAX_AGE_SECS: i64 = 86_400 * 30;

const THEMES: &[(&str, &[&str])] = &[
    (
        "meditation",
        &[
            "Twenty quiet minutes this morning and the whole day felt slower.",
            "Group sits always feel different from sitting alone at home.",
            "Starting an evening practice next week, anyone want to join?",
            "The hall was packed for the sunrise session today.",
            "Ten years of daily practice as of this week. Grateful.",
        ],
    ),
    (
        "community",
        &[
            "The new food co-op opens Saturday with produce from nearby farms.",
            "Looking for a roommate near downtown, quiet household preferred.",
            "Anyone driving to the airport next Friday? Happy to split gas.",
            "Potluck at the community center this Sunday, bring a dish.",
            "Lost cat near First Street, orange tabby, answers to Miso.",
        ],
    ),
    (
        "education",
        &[
            "Spring enrollment is open and the new faculty look great.",
            "Intro programming workshop at the library every Tuesday.",
            "Language class starts next week at the community center.",
            "Reading group is discussing systems thinking this month.",
            "Physics department thesis defense open to the public Friday.",
        ],
    ),
    (
        "wellness",
        &[
            "New yoga studio on Main Street, beginner classes every morning.",
            "The cafe added vegan lunch options and the soup is excellent.",
            "Cooking class Saturday focused on simple seasonal meals.",
            "Morning stretching in the park, all levels welcome, 6am.",
            "Herbal tea tasting at the clinic this weekend.",
        ],
    ),
    (
        "events",
        &[
            "Summer music festival lineup announced, tickets on sale now.",
            "Annual health fair on campus with free screenings.",
            "Architecture walking tour of the east side this Saturday.",
            "Documentary screening at the theater followed by a Q&A.",
            "Lantern festival preparations underway, volunteers needed.",
        ],
    ),
];

const CHANNELS: &[(&str, &str)] = &[
    ("meditation-circle", "Daily practice experiences and insights"),
    ("community-board", "Local events, classifieds, and community news"),
    ("campus-life", "Student discussions and campus news"),
    ("wellness-corner", "Health and everyday living"),
    ("events-calendar", "Upcoming events and gatherings"),
    ("housing-exchange", "Rooms, apartments, and housing needs"),
    ("carpool-connect", "Ride sharing and transportation"),
];

const NOTES: &[&str] = &[
    "Beautiful sunrise over the hills this morning.",
    "Just moved here from the coast. Everyone is so welcoming!",
    "The town meeting was productive, good turnout.",
    "Finished a great book on community gardens last night.",
    "Gardens are blooming all over the neighborhood.",
    "Grateful for this community. Nowhere else quite like it.",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// Content-addressed id over the event fields
pub fn content_id(pubkey: &str, created_at: i64, kind: u16, tags: &[Vec<String>], content: &str) -> String {
    let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
}

fn make_event(pubkey: &str, created_at: i64, kind: u16, tags: Vec<Vec<String>>, content: String) -> Event {
    Event {
        id: content_id(pubkey, created_at, kind, &tags, &content),
        pubkey: pubkey.to_string(),
        created_at,
        kind,
        tags,
        content,
        sig: "0".repeat(128),
    }
}

fn channel_for(theme: &str, rng: &mut StdRng) -> &'static str {
    match theme {
        "meditation" => "meditation-circle",
        "community" => ["community-board", "housing-exchange", "carpool-connect"]
            .choose(rng)
            .copied()
            .unwrap_or("community-board"),
        "education" => "campus-life",
        "wellness" => "wellness-corner",
        _ => "events-calendar",
    }
}

/// Generate channels, posts and notes. Deterministic for a given `seed`
/// and `now`.
pub fn generate(seed: u64, now: i64) -> Vec<Event> {
    let mut rng = StdRng::seed_from_u64(seed);
    let users: Vec<String> = (0..USERS)
        .map(|_| {
            let secret: [u8; 32] = rng.gen();
            hex::encode(Sha256::digest(hex::encode(secret).as_bytes()))
        })
        .collect();

    let pick_user = |rng: &mut StdRng| users[rng.gen_range(0..users.len())].clone();
    let mut events = Vec::new();
    let mut channel_ids = Vec::new();

    for (name, about) in CHANNELS {
        let pubkey = pick_user(&mut rng);
        let created_at = now - rng.gen_range(0..=MAX_AGE_SECS);
        let content = serde_json::json!({ "name": name, "about": about }).to_string();
        let event = make_event(&pubkey, created_at, KIND_CHANNEL, Vec::new(), content);
        channel_ids.push((*name, event.id.clone()));
        events.push(event);
    }

    for (theme, messages) in THEMES {
        for message in *messages {
            let pubkey = pick_user(&mut rng);
            let channel = channel_for(theme, &mut rng);
            let Some((_, channel_id)) = channel_ids.iter().find(|(n, _)| *n == channel) else {
                continue;
            };
            let tags = vec![vec![
                "e".to_string(),
                channel_id.clone(),
                String::new(),
                "root".to_string(),
            ]];
            let created_at = now - rng.gen_range(0..=MAX_AGE_SECS);
            events.push(make_event(&pubkey, created_at, KIND_CHANNEL_POST, tags, message.to_string()));
        }
    }

    for note in NOTES {
        let pubkey = pick_user(&mut rng);
        let created_at = now - rng.gen_range(0..=MAX_AGE_SECS);
        events.push(make_event(&pubkey, created_at, KIND_NOTE, Vec::new(), note.to_string()));
    }

    events
}

/// The searchable subset: channel posts and notes, keyed by event id
pub fn searchable_documents(events: &[Event]) -> Vec<TextDocument> {
    events
        .iter()
        .filter(|e| e.kind == KIND_CHANNEL_POST || e.kind == KIND_NOTE)
        .map(|e| TextDocument {
            id: e.id.clone(),
            text: e.content.clone(),
        })
        .collect()
}
