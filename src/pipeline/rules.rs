//! Intent classifier: priority-ordered pattern tiers.
//!
//! Pure and deterministic: text + attachment flag + role + flow state in,
//! `Classification` out. Tiers are evaluated in order and the first match
//! wins:
//! 1. identity verification command
//! 2. staff commands (staff only, never when the text contains `?`)
//! 3. conversational patterns, then a low-confidence fallback

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::identity::Role;
use crate::pipeline::flow::FlowState;
use crate::pipeline::types::{Classification, Intent};

static VERIFY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*/?(?:verify|verifikasi)\s+(\+?[\d][\d\s\-().]{5,})\s*$").unwrap()
});

static BARE_GREETING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:halo+|hallo+|hai+|hi+|hello+|hey+|helo|pagi|siang|sore|malam|selamat\s+(?:pagi|siang|sore|malam)|assalamu.?alaikum|permisi|p)(?:\s+(?:kak|min|admin|gan|bos|pak|bu|mas|mbak|sis))?\s*[.!]*\s*$",
    )
    .unwrap()
});

static HELP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*/?(?:help|bantuan|menu|start)\s*[.!]*\s*$").unwrap());

static CANCEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*/?(?:batal|batalkan|cancel|stop|ga\s+jadi|gak\s+jadi|nggak\s+jadi)\s*[.!]*\s*$")
        .unwrap()
});

/// Closing phrases only count on short messages.
const CLOSING_MAX_WORDS: usize = 6;

/// A single classification rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct IntentRule {
    /// Human-readable pattern description.
    pub pattern: String,
    /// Compiled regex for matching.
    pub regex: Regex,
    pub intent: Intent,
    pub confidence: f32,
}

impl IntentRule {
    fn new(pattern: &str, regex: &str, intent: Intent, confidence: f32) -> Self {
        Self {
            pattern: pattern.into(),
            regex: Regex::new(regex).unwrap(),
            intent,
            confidence,
        }
    }
}

/// Why a message interrupts an active flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowInterrupt {
    Greeting,
    Help,
    Cancel,
}

/// Whether the text is nothing but a greeting.
pub fn is_bare_greeting(text: &str) -> bool {
    BARE_GREETING.is_match(text)
}

/// Whether the text should interrupt an active flow, and why.
pub fn flow_interrupt(text: &str) -> Option<FlowInterrupt> {
    if is_bare_greeting(text) {
        Some(FlowInterrupt::Greeting)
    } else if HELP.is_match(text) {
        Some(FlowInterrupt::Help)
    } else if CANCEL.is_match(text) {
        Some(FlowInterrupt::Cancel)
    } else {
        None
    }
}

/// The address claimed by a verification command.
pub fn verification_claim(text: &str) -> Option<String> {
    VERIFY.captures(text).map(|caps| caps[1].trim().to_string())
}

/// Priority-ordered intent classifier.
pub struct IntentClassifier {
    staff_rules: Vec<IntentRule>,
    conversational_rules: Vec<IntentRule>,
}

impl IntentClassifier {
    /// Create a classifier with the default Indonesian/English rule tables.
    pub fn default_rules() -> Self {
        let staff_rules = vec![
            IntentRule::new(
                "upload",
                r"(?i)^\s*/?(?:upload|tambah\s+(?:mobil|unit|data)|input\s+(?:mobil|unit|data))\b",
                Intent::StaffUpload,
                0.95,
            ),
            // Before edit: "status <id> sold" must not be read as a field edit.
            IntentRule::new(
                "status change",
                r"(?i)^\s*(?:/status\s+\S+\s+\S+|(?:status|tandai|mark)\s+\S+\s+(?:sold|terjual|laku|booked|booking|dp|reserved|available|tersedia|ready)\s*$)",
                Intent::StaffStatus,
                0.95,
            ),
            IntentRule::new(
                "inventory",
                r"(?i)^\s*/?(?:stok|stock|inventory|inventori|daftar\s+mobil|list\s+mobil|katalog)\b",
                Intent::StaffInventory,
                0.95,
            ),
            IntentRule::new(
                "statistics",
                r"(?i)^\s*/?(?:stats|statistik|laporan|report|rekap)\b",
                Intent::StaffStats,
                0.95,
            ),
            IntentRule::new(
                "edit",
                r"(?i)^\s*/?(?:edit|ubah|ganti|update)\s+\S+",
                Intent::StaffEdit,
                0.9,
            ),
            IntentRule::new(
                "help",
                r"(?i)^\s*/?(?:help|bantuan|menu|start)\s*[.!]*\s*$",
                Intent::StaffHelp,
                0.9,
            ),
        ];

        let conversational_rules = vec![
            IntentRule::new(
                "short confirmation",
                r"(?i)^\s*(?:ya|iya|yes|yup|ok|oke|okay|boleh|kirim|send|mau|lanjut|gas|siap|sip)\s*(?:kak|min|dong|ya)?\s*[.!]*\s*$",
                Intent::CustomerConfirmation,
                0.9,
            ),
            IntentRule::new(
                "closing",
                r"(?i)\b(?:terima\s*kasih|makasih|makasi|thanks|thank\s+you|thx|tq|sampai\s+jumpa|bye)\b",
                Intent::CustomerClosing,
                0.9,
            ),
            IntentRule::new(
                "decline",
                r"(?i)^\s*(?:tidak|nggak|ngga|gak|ga|enggak|no|nope|belum|skip)\b",
                Intent::CustomerDecline,
                0.85,
            ),
            IntentRule::new(
                "follow-up",
                r"(?i)^\s*(?:lalu|terus|trus|kalau|kalo|bagaimana\s+dengan|gimana\s+dengan|yang\s+(?:lain|itu|tadi)|ada\s+lagi|selain\s+itu|and|what\s+about)\b",
                Intent::CustomerFollowUp,
                0.75,
            ),
            IntentRule::new(
                "photo request",
                r"(?i)\b(?:foto|photo|gambar|pic|picture|video)\b",
                Intent::CustomerPhotoRequest,
                0.85,
            ),
            IntentRule::new(
                "greeting",
                BARE_GREETING.as_str(),
                Intent::CustomerGreeting,
                0.9,
            ),
            IntentRule::new(
                "price inquiry",
                r"(?i)\b(?:harga|price|berapa|nego|cicilan|kredit|angsuran|dp|diskon|otr)\b",
                Intent::CustomerPriceInquiry,
                0.8,
            ),
            IntentRule::new(
                "schedule",
                r"(?i)\b(?:jadwal|test\s*drive|kapan|jam\s+buka|buka\s+jam|datang|ketemu|janji|appointment|survei|survey)\b",
                Intent::CustomerSchedule,
                0.8,
            ),
            IntentRule::new(
                "record inquiry",
                r"(?i)\b(?:mobil|unit|ready|tersedia|stok|stock|masih\s+ada|tipe|type|matic|manual|tahun|km)\b",
                Intent::CustomerRecordInquiry,
                0.7,
            ),
            IntentRule::new(
                "contact",
                r"(?i)\b(?:alamat|lokasi|nomor|telepon|telp|whatsapp|hubungi|kontak|contact|address|location|maps)\b",
                Intent::CustomerContact,
                0.8,
            ),
            IntentRule::new(
                "about assistant",
                r"(?i)(?:siapa\s+(?:kamu|anda|ini)|(?:kamu|anda)\s+siapa|(?:kamu|anda)\s+(?:bot|robot|manusia|ai)|are\s+you\s+(?:a\s+)?(?:bot|human|ai|real))",
                Intent::CustomerAbout,
                0.8,
            ),
        ];

        Self {
            staff_rules,
            conversational_rules,
        }
    }

    /// Classify one inbound message.
    pub fn classify(
        &self,
        text: &str,
        has_attachment: bool,
        role: Role,
        state: FlowState,
    ) -> Classification {
        let text = text.trim();

        // Uncaptioned media from staff inside a flow is always flow input.
        if has_attachment && text.is_empty() && role.is_staff() && state != FlowState::Idle {
            return Classification::new(Intent::StaffContinueFlow, 0.99, "attachment in flow");
        }

        // Tier 1: identity verification
        if VERIFY.is_match(text) {
            return Classification::new(Intent::VerifyIdentity, 0.99, "verification command");
        }

        // Tier 2: staff commands; a question is never a command
        if role.is_staff() && !text.contains('?') {
            if let Some(rule) = self.staff_rules.iter().find(|r| r.regex.is_match(text)) {
                debug!(rule = %rule.pattern, "Staff command matched");
                return Classification::new(rule.intent, rule.confidence, rule.pattern.clone());
            }
            if is_bare_greeting(text) {
                return Classification::new(Intent::StaffHelp, 0.85, "staff greeting");
            }
        }

        // Tier 3: conversational
        let word_count = text.split_whitespace().count();
        for rule in &self.conversational_rules {
            if rule.intent == Intent::CustomerClosing && word_count > CLOSING_MAX_WORDS {
                continue;
            }
            if rule.regex.is_match(text) {
                debug!(rule = %rule.pattern, "Conversational rule matched");
                return Classification::new(rule.intent, rule.confidence, rule.pattern.clone());
            }
        }

        Classification::new(Intent::CustomerGeneral, 0.3, "fallback")
    }
}
