use std::fmt;
use std::hash::{Hash, Hasher};

use crate::gmail::types::GmailLabel;

pub const INBOX: &str = "INBOX";
pub const SPAM: &str = "SPAM";
pub const TRASH: &str = "TRASH";
pub const UNREAD: &str = "UNREAD";
pub const STARRED: &str = "STARRED";
pub const SENT: &str = "SENT";
pub const IMPORTANT: &str = "IMPORTANT";
pub const DRAFT: &str = "DRAFT";
pub const PERSONAL: &str = "CATEGORY_PERSONAL";
pub const SOCIAL: &str = "CATEGORY_SOCIAL";
pub const PROMOTIONS: &str = "CATEGORY_PROMOTIONS";
pub const UPDATES: &str = "CATEGORY_UPDATES";
pub const FORUMS: &str = "CATEGORY_FORUMS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageListVisibility {
    Show,
    Hide,
}

impl MessageListVisibility {
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Show => "show",
            Self::Hide => "hide",
        }
    }

    fn from_wire(value: &str) -> Option<Self> {
        match value {
            "show" => Some(Self::Show),
            "hide" => Some(Self::Hide),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelListVisibility {
    Show,
    Hide,
    ShowIfUnread,
}

impl LabelListVisibility {
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Show => "labelShow",
            Self::Hide => "labelHide",
            Self::ShowIfUnread => "labelShowIfUnread",
        }
    }

    fn from_wire(value: &str) -> Option<Self> {
        match value {
            "labelShow" => Some(Self::Show),
            "labelHide" => Some(Self::Hide),
            "labelShowIfUnread" => Some(Self::ShowIfUnread),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelType {
    System,
    User,
}

/// A Gmail label. Two labels are equal when their ids are.
#[derive(Debug, Clone)]
pub struct Label {
    pub id: String,
    pub name: String,
    pub message_list_visibility: Option<MessageListVisibility>,
    pub label_list_visibility: Option<LabelListVisibility>,
    pub label_type: Option<LabelType>,
}

impl Label {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            message_list_visibility: None,
            label_list_visibility: None,
            label_type: None,
        }
    }

    /// One of the built-in labels, whose name equals its id.
    pub fn system(id: &str) -> Self {
        Self {
            label_type: Some(LabelType::System),
            ..Self::new(id, id)
        }
    }
}

impl From<GmailLabel> for Label {
    fn from(label: GmailLabel) -> Self {
        Self {
            message_list_visibility: label
                .message_list_visibility
                .as_deref()
                .and_then(MessageListVisibility::from_wire),
            label_list_visibility: label
                .label_list_visibility
                .as_deref()
                .and_then(LabelListVisibility::from_wire),
            label_type: match label.label_type.as_deref() {
                Some("system") => Some(LabelType::System),
                Some("user") => Some(LabelType::User),
                _ => None,
            },
            id: label.id,
            name: label.name,
        }
    }
}

impl PartialEq for Label {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Label {}

impl Hash for Label {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialEq<str> for Label {
    fn eq(&self, other: &str) -> bool {
        self.id == other
    }
}

impl PartialEq<&str> for Label {
    fn eq(&self, other: &&str) -> bool {
        self.id == *other
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Anything that names a label by id: a [`Label`] or a raw id string.
pub trait LabelRef {
    fn label_id(&self) -> &str;
}

impl LabelRef for Label {
    fn label_id(&self) -> &str {
        &self.id
    }
}

impl LabelRef for str {
    fn label_id(&self) -> &str {
        self
    }
}

impl LabelRef for String {
    fn label_id(&self) -> &str {
        self
    }
}

impl<T: LabelRef + ?Sized> LabelRef for &T {
    fn label_id(&self) -> &str {
        (**self).label_id()
    }
}

pub fn label_ids<L: LabelRef>(labels: &[L]) -> Vec<String> {
    labels.iter().map(|l| l.label_id().to_string()).collect()
}
