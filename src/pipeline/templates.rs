//! Fixed reply templates.
//!
//! Everything the orchestrator says without the AI responder lives here.

use chrono::{DateTime, Duration, Timelike, Utc};

use crate::identity::{RejectReason, StaffRole, VerificationOutcome};

/// Period of the day used in greetings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOfDay {
    Pagi,
    Siang,
    Sore,
    Malam,
}

impl TimeOfDay {
    /// Period for `now` shifted into the tenant's local time.
    pub fn at(now: DateTime<Utc>, utc_offset_hours: i32) -> Self {
        let local = now + Duration::hours(i64::from(utc_offset_hours));
        match local.hour() {
            4..=10 => Self::Pagi,
            11..=14 => Self::Siang,
            15..=17 => Self::Sore,
            _ => Self::Malam,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pagi => "pagi",
            Self::Siang => "siang",
            Self::Sore => "sore",
            Self::Malam => "malam",
        }
    }
}

pub fn customer_greeting(tod: TimeOfDay, assistant_name: &str, business_name: &str) -> String {
    format!(
        "Selamat {} kak 👋 Saya {assistant_name} dari {business_name}. Ada yang bisa saya bantu? \
         Kakak bisa tanya stok, harga, atau jadwal test drive.",
        tod.as_str()
    )
}

pub fn staff_help_menu(tod: TimeOfDay, role: StaffRole) -> String {
    let mut menu = format!(
        "Selamat {} ({role}). Perintah yang tersedia:\n\
         • /upload Toyota Avanza 2020 150jt : tambah mobil\n\
         • /stok : daftar mobil tersedia\n\
         • /edit [ID] harga 145jt : ubah data\n",
        tod.as_str()
    );
    if role >= StaffRole::Manager {
        menu.push_str(
            "• /status ID terjual : ubah status\n\
             • /stats : ringkasan stok\n",
        );
    }
    menu.push_str("• /verify 08xxxx : hubungkan nomor ini");
    menu
}

pub fn closing() -> &'static str {
    "Sama-sama kak 🙏 Senang bisa membantu. Kabari kami kapan saja ya."
}

/// Sent when the responder is disabled or fails.
pub fn responder_fallback() -> &'static str {
    "Terima kasih, pesan kakak sudah kami terima. Tim kami akan segera membalas ya 🙏"
}

/// Sent when anything unexpected goes wrong.
pub fn apology() -> &'static str {
    "Maaf kak, sedang ada gangguan. Mohon coba lagi sebentar lagi 🙏"
}

pub fn staff_only() -> &'static str {
    "Maaf, permintaan tersebut hanya untuk staf showroom."
}

pub fn insufficient_role(required: StaffRole) -> String {
    format!("Perintah ini membutuhkan akses {required} atau lebih tinggi.")
}

pub fn flow_cancelled(reply: &str) -> String {
    format!("Oke, dibatalkan.\n\n{reply}")
}

pub fn flow_expired() -> &'static str {
    "Proses sebelumnya sudah kedaluwarsa karena tidak ada aktivitas."
}

pub fn verification(outcome: &VerificationOutcome) -> String {
    match outcome {
        VerificationOutcome::Verified { canonical, role } => format!(
            "✅ Nomor ini sekarang terhubung ke {canonical} ({role}). Ketik /help untuk melihat menu."
        ),
        VerificationOutcome::AlreadyVerified { canonical, role } => {
            format!("Nomor ini sudah terhubung ke {canonical} ({role}).")
        }
        VerificationOutcome::Rejected(reason) => match reason {
            RejectReason::InvalidAddress => {
                "Nomor yang dikirim tidak valid. Contoh: /verify 081234567890".to_string()
            }
            RejectReason::NotRegisteredStaff => {
                "Nomor tersebut tidak terdaftar sebagai staf.".to_string()
            }
            RejectReason::NotAnAlias => {
                "Nomor ini sudah dikenali langsung, tidak perlu verifikasi.".to_string()
            }
            RejectReason::AliasBoundElsewhere { .. } => {
                "Perangkat ini sudah terhubung ke nomor staf lain. Hubungi admin.".to_string()
            }
            RejectReason::NeedsConfirmation { .. } => {
                "Nomor tersebut sudah terhubung ke perangkat lain. Minta admin mendaftarkan perangkat ini."
                    .to_string()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn time_of_day_uses_local_offset() {
        // 01:00 UTC is 08:00 in UTC+7.
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 1, 0, 0).unwrap();
        assert_eq!(TimeOfDay::at(now, 7), TimeOfDay::Pagi);
        assert_eq!(TimeOfDay::at(now, 0), TimeOfDay::Malam);

        let afternoon = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        assert_eq!(TimeOfDay::at(afternoon, 7), TimeOfDay::Sore);
    }

    #[test]
    fn help_menu_depends_on_level() {
        let operator = staff_help_menu(TimeOfDay::Siang, StaffRole::Operator);
        assert!(!operator.contains("/stats"));
        let owner = staff_help_menu(TimeOfDay::Siang, StaffRole::Owner);
        assert!(owner.contains("/stats"));
        assert!(owner.starts_with("Selamat siang"));
    }

    #[test]
    fn rejection_never_leaks_canonical() {
        let reply = verification(&VerificationOutcome::Rejected(
            RejectReason::AliasBoundElsewhere {
                canonical: "62811".into(),
            },
        ));
        assert!(!reply.contains("62811"));
    }
}
