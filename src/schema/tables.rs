//! Column layouts of the Stack Exchange dump tables

use super::{ColumnDescriptor as C, ColumnType::*, DerivedColumn, TableSchema};

pub static POSTS: TableSchema = TableSchema {
    name: "posts",
    columns: &[
        C::new("Id", 0, Int32, false),
        C::new("PostTypeId", 1, Int32, false),
        C::new("AcceptedAnswerId", 2, Int32, true),
        C::new("ParentId", 3, Int32, true),
        C::new("CreationDate", 4, DateTime, false),
        C::new("DeletionDate", 5, DateTime, true),
        C::new("Score", 6, Int32, false),
        C::new("ViewCount", 7, Int32, true),
        C::new("Body", 8, String, true),
        C::new("OwnerUserId", 9, Int32, true),
        C::new("OwnerDisplayName", 10, String, true),
        C::new("LastEditorUserId", 11, Int32, true),
        C::new("LastEditorDisplayName", 12, String, true),
        C::new("LastEditDate", 13, DateTime, true),
        C::new("LastActivityDate", 14, DateTime, true),
        C::new("Title", 15, String, true),
        C::new("Tags", 16, String, true),
        C::new("AnswerCount", 17, Int32, true),
        C::new("CommentCount", 18, Int32, true),
        C::new("FavoriteCount", 19, Int32, true),
        C::new("ClosedDate", 20, DateTime, true),
        C::new("CommunityOwnedDate", 21, DateTime, true),
        C::new("ContentLicense", 22, String, true),
    ],
    primary_key: Some(0),
    large_text: true,
    bytes_per_row: 2_400,
    derived: Some(DerivedColumn {
        key_ordinal: 0,
        source_ordinal: 16,
        target: &POST_TAGS,
    }),
};

pub static POST_TAGS: TableSchema = TableSchema {
    name: "posttags",
    columns: &[C::new("PostId", 0, Int32, false), C::new("Tag", 1, String, false)],
    primary_key: None,
    large_text: false,
    bytes_per_row: 40,
    derived: None,
};

pub static USERS: TableSchema = TableSchema {
    name: "users",
    columns: &[
        C::new("Id", 0, Int32, false),
        C::new("Reputation", 1, Int32, false),
        C::new("CreationDate", 2, DateTime, false),
        C::new("DisplayName", 3, String, true),
        C::new("LastAccessDate", 4, DateTime, true),
        C::new("WebsiteUrl", 5, String, true),
        C::new("Location", 6, String, true),
        C::new("AboutMe", 7, String, true),
        C::new("Views", 8, Int32, true),
        C::new("UpVotes", 9, Int32, true),
        C::new("DownVotes", 10, Int32, true),
        C::new("ProfileImageUrl", 11, String, true),
        C::new("EmailHash", 12, String, true),
        C::new("AccountId", 13, Int64, true),
    ],
    primary_key: Some(0),
    large_text: true,
    bytes_per_row: 620,
    derived: None,
};

pub static VOTES: TableSchema = TableSchema {
    name: "votes",
    columns: &[
        C::new("Id", 0, Int32, false),
        C::new("PostId", 1, Int32, false),
        C::new("VoteTypeId", 2, Int32, false),
        C::new("UserId", 3, Int32, true),
        C::new("CreationDate", 4, DateTime, true),
        C::new("BountyAmount", 5, Int32, true),
    ],
    primary_key: Some(0),
    large_text: false,
    bytes_per_row: 95,
    derived: None,
};

pub static COMMENTS: TableSchema = TableSchema {
    name: "comments",
    columns: &[
        C::new("Id", 0, Int32, false),
        C::new("PostId", 1, Int32, false),
        C::new("Score", 2, Int32, true),
        C::new("Text", 3, String, false),
        C::new("CreationDate", 4, DateTime, false),
        C::new("UserDisplayName", 5, String, true),
        C::new("UserId", 6, Int32, true),
        C::new("ContentLicense", 7, String, true),
    ],
    primary_key: Some(0),
    large_text: false,
    bytes_per_row: 330,
    derived: None,
};

pub static BADGES: TableSchema = TableSchema {
    name: "badges",
    columns: &[
        C::new("Id", 0, Int32, false),
        C::new("UserId", 1, Int32, false),
        C::new("Name", 2, String, false),
        C::new("Date", 3, DateTime, false),
        C::new("Class", 4, Int32, false),
        C::new("TagBased", 5, Boolean, false),
    ],
    primary_key: Some(0),
    large_text: false,
    bytes_per_row: 110,
    derived: None,
};

pub static POST_HISTORY: TableSchema = TableSchema {
    name: "posthistory",
    columns: &[
        C::new("Id", 0, Int32, false),
        C::new("PostHistoryTypeId", 1, Int32, false),
        C::new("PostId", 2, Int32, false),
        C::new("RevisionGUID", 3, Guid, true),
        C::new("CreationDate", 4, DateTime, false),
        C::new("UserId", 5, Int32, true),
        C::new("UserDisplayName", 6, String, true),
        C::new("Comment", 7, String, true),
        C::new("Text", 8, String, true),
        C::new("ContentLicense", 9, String, true),
    ],
    primary_key: Some(0),
    large_text: true,
    bytes_per_row: 1_900,
    derived: None,
};

pub static POST_LINKS: TableSchema = TableSchema {
    name: "postlinks",
    columns: &[
        C::new("Id", 0, Int32, false),
        C::new("CreationDate", 1, DateTime, false),
        C::new("PostId", 2, Int32, false),
        C::new("RelatedPostId", 3, Int32, false),
        C::new("LinkTypeId", 4, Int32, false),
    ],
    primary_key: Some(0),
    large_text: false,
    bytes_per_row: 120,
    derived: None,
};

pub static TAGS: TableSchema = TableSchema {
    name: "tags",
    columns: &[
        C::new("Id", 0, Int32, false),
        C::new("TagName", 1, String, false),
        C::new("Count", 2, Int32, false),
        C::new("ExcerptPostId", 3, Int32, true),
        C::new("WikiPostId", 4, Int32, true),
        C::new("IsModeratorOnly", 5, Boolean, true),
        C::new("IsRequired", 6, Boolean, true),
    ],
    primary_key: Some(0),
    large_text: false,
    bytes_per_row: 90,
    derived: None,
};

/// Tables loaded from dump files, in load order
pub static TABLES: [&TableSchema; 8] = [
    &USERS,
    &POSTS,
    &POST_HISTORY,
    &COMMENTS,
    &VOTES,
    &BADGES,
    &POST_LINKS,
    &TAGS,
];

/// Small `(Id, Name)` type tables filled from built-in values
#[derive(Debug)]
pub struct LookupTable {
    pub name: &'static str,
    pub values: &'static [(i32, &'static str)],
}

pub static LOOKUP_TABLES: [LookupTable; 3] = [
    LookupTable {
        name: "posttypes",
        values: &[
            (1, "Question"),
            (2, "Answer"),
            (3, "Orphaned tag wiki"),
            (4, "Tag wiki excerpt"),
            (5, "Tag wiki"),
            (6, "Moderator nomination"),
            (7, "Wiki placeholder"),
            (8, "Privilege wiki"),
        ],
    },
    LookupTable {
        name: "votetypes",
        values: &[
            (1, "AcceptedByOriginator"),
            (2, "UpMod"),
            (3, "DownMod"),
            (4, "Offensive"),
            (5, "Favorite"),
            (6, "Close"),
            (7, "Reopen"),
            (8, "BountyStart"),
            (9, "BountyClose"),
            (10, "Deletion"),
            (11, "Undeletion"),
            (12, "Spam"),
            (15, "ModeratorReview"),
            (16, "ApproveEditSuggestion"),
        ],
    },
    LookupTable {
        name: "linktypes",
        values: &[(1, "Linked"), (3, "Duplicate")],
    },
];
