//! Scripted staff commands.
//!
//! Handles `/upload`, `/status`, `/stok`, `/stats`, `/edit` and `/help`
//! without the AI responder. Each command has a minimum staff level.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::info;

use crate::error::{DatabaseError, Error};
use crate::identity::{Role, StaffRole};
use crate::pipeline::fields::{RecordFields, format_price, parse_field_update};
use crate::pipeline::flow::{FlowContext, FlowEngine};
use crate::pipeline::templates::{self, TimeOfDay};
use crate::pipeline::types::Intent;
use crate::store::{RecordStatus, RecordUpdate, Storage};

static STATUS_ARGS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*/?(?:status|tandai|mark)\s+(\S+)\s+(\S+)").unwrap()
});

static COMMAND_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*/?(?:edit|ubah|ganti|update)\s+").unwrap());

const FIELD_NAMES: &[&str] = &[
    "merk", "make", "brand", "model", "tipe", "type", "tahun", "year", "harga", "price", "warna",
    "color", "colour", "km", "kilometer", "mileage", "status",
];

const INVENTORY_LIMIT: usize = 20;

/// Reply to a staff command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub text: String,
    /// Replacement flow context, when the command changed it.
    pub context: Option<FlowContext>,
    /// Whether a requested change was refused or failed.
    pub failed: bool,
}

impl CommandReply {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context: None,
            failed: false,
        }
    }

    fn refused(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context: None,
            failed: true,
        }
    }

    fn with_context(mut self, context: FlowContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// Minimum staff level for a command intent.
pub fn required_level(intent: Intent) -> StaffRole {
    match intent {
        Intent::StaffStatus | Intent::StaffStats => StaffRole::Manager,
        _ => StaffRole::Operator,
    }
}

pub struct CommandHandler {
    store: Arc<dyn Storage>,
    flows: Arc<FlowEngine>,
    utc_offset_hours: i32,
}

impl CommandHandler {
    pub fn new(store: Arc<dyn Storage>, flows: Arc<FlowEngine>, utc_offset_hours: i32) -> Self {
        Self {
            store,
            flows,
            utc_offset_hours,
        }
    }

    /// Run one staff command. `context` is the conversation's current flow.
    pub async fn handle(
        &self,
        tenant_id: &str,
        intent: Intent,
        text: &str,
        attachment: Option<&str>,
        role: Role,
        context: &FlowContext,
    ) -> Result<CommandReply, Error> {
        let Some(level) = role.staff_level() else {
            return Ok(CommandReply::refused(templates::staff_only()));
        };
        let required = required_level(intent);
        if level < required {
            info!(tenant = %tenant_id, command = %intent, level = %level, "Command refused");
            return Ok(CommandReply::refused(templates::insufficient_role(required)));
        }

        match intent {
            Intent::StaffUpload => {
                let step = self
                    .flows
                    .start(tenant_id, RecordFields::parse(text), attachment)
                    .await?;
                Ok(CommandReply {
                    text: step.reply,
                    context: Some(step.context),
                    failed: step.failed,
                })
            }
            Intent::StaffStatus => self.change_status(tenant_id, text, context).await,
            Intent::StaffInventory => self.inventory(tenant_id).await,
            Intent::StaffStats => self.stats(tenant_id).await,
            Intent::StaffEdit => self.edit(tenant_id, text, level, context).await,
            _ => {
                let tod = TimeOfDay::at(chrono::Utc::now(), self.utc_offset_hours);
                Ok(CommandReply::text(templates::staff_help_menu(tod, level)))
            }
        }
    }

    async fn change_status(
        &self,
        tenant_id: &str,
        text: &str,
        context: &FlowContext,
    ) -> Result<CommandReply, Error> {
        let Some(caps) = STATUS_ARGS.captures(text) else {
            return Ok(CommandReply::refused("Format: /status ID terjual"));
        };
        let record_id = caps[1].to_uppercase();
        let status: RecordStatus = match caps[2].parse() {
            Ok(status) => status,
            Err(_) => {
                return Ok(CommandReply::refused(
                    "Status tidak dikenal. Pilih: tersedia, booking, terjual.",
                ));
            }
        };

        match self
            .store
            .update_record(tenant_id, &record_id, &RecordUpdate::Status(status))
            .await
        {
            Ok(()) => {}
            Err(DatabaseError::NotFound { .. }) => {
                return Ok(CommandReply::refused(format!("ID {record_id} tidak ditemukan.")));
            }
            Err(e) => return Err(e.into()),
        }
        info!(tenant = %tenant_id, record_id = %record_id, status = status.as_str(), "Record status changed");

        let reply = CommandReply::text(format!(
            "✅ Status {record_id} diubah menjadi {}.",
            status.label_id()
        ));
        Ok(remember_record(reply, context, &record_id))
    }

    async fn inventory(&self, tenant_id: &str) -> Result<CommandReply, Error> {
        let records = self
            .store
            .list_records(tenant_id, Some(RecordStatus::Available), INVENTORY_LIMIT)
            .await?;
        if records.is_empty() {
            return Ok(CommandReply::text("Belum ada mobil tersedia. Tambah dengan /upload."));
        }
        let mut text = format!("📋 Stok tersedia ({}):\n", records.len());
        for record in &records {
            text.push_str(&format!(
                "• {} {} - {} ({} foto)\n",
                record.id,
                record.title(),
                format_price(record.price),
                record.photos.len()
            ));
        }
        Ok(CommandReply::text(text.trim_end()))
    }

    async fn stats(&self, tenant_id: &str) -> Result<CommandReply, Error> {
        let stats = self.store.record_stats(tenant_id).await?;
        Ok(CommandReply::text(format!(
            "📊 Ringkasan stok\nTersedia: {}\nBooking: {}\nTerjual: {}\nTotal: {}",
            stats.available,
            stats.booked,
            stats.sold,
            stats.total()
        )))
    }

    /// `/edit [id] <field> <value>`; without an id, the last record touched.
    async fn edit(
        &self,
        tenant_id: &str,
        text: &str,
        level: StaffRole,
        context: &FlowContext,
    ) -> Result<CommandReply, Error> {
        let args = COMMAND_WORD.replace(text, "");
        let mut tokens = args.split_whitespace();
        let Some(first) = tokens.next() else {
            return Ok(CommandReply::refused("Format: /edit [ID] harga 145jt"));
        };

        let (record_id, field) = if FIELD_NAMES.contains(&first.to_lowercase().as_str()) {
            match context.record_id() {
                Some(id) => (id.to_string(), first.to_string()),
                None => {
                    return Ok(CommandReply::refused(
                        "Sebutkan ID mobil. Format: /edit ID harga 145jt",
                    ));
                }
            }
        } else {
            let Some(field) = tokens.next() else {
                return Ok(CommandReply::refused("Format: /edit [ID] harga 145jt"));
            };
            (first.to_uppercase(), field.to_string())
        };
        let value = tokens.collect::<Vec<_>>().join(" ");
        self.apply_edit(tenant_id, &record_id, &field, &value, level, context)
            .await
    }

    /// Change one field of a record; shared by `/edit` and the responder's
    /// edit tool. A status change needs the same level as `/status`.
    pub async fn apply_edit(
        &self,
        tenant_id: &str,
        record_id: &str,
        field: &str,
        value: &str,
        level: StaffRole,
        context: &FlowContext,
    ) -> Result<CommandReply, Error> {
        let record_id = record_id.to_uppercase();
        let update = match parse_field_update(field, value) {
            Ok(update) => update,
            Err(reason) => return Ok(CommandReply::refused(format!("⚠️ {reason}"))),
        };
        if let RecordUpdate::Status(_) = update {
            let required = required_level(Intent::StaffStatus);
            if level < required {
                info!(tenant = %tenant_id, record_id = %record_id, level = %level, "Status edit refused");
                return Ok(CommandReply::refused(templates::insufficient_role(required)));
            }
        }

        match self.store.update_record(tenant_id, &record_id, &update).await {
            Ok(()) => {}
            Err(DatabaseError::NotFound { .. }) => {
                return Ok(CommandReply::refused(format!("ID {record_id} tidak ditemukan.")));
            }
            Err(e) => return Err(e.into()),
        }
        info!(tenant = %tenant_id, record_id = %record_id, field = %field, "Record edited");

        let reply = CommandReply::text(format!("✅ {record_id}: {} diperbarui.", describe(&update)));
        Ok(remember_record(reply, context, &record_id))
    }
}

/// Outside a flow, remember the record for a later `/edit` without an id.
fn remember_record(reply: CommandReply, context: &FlowContext, record_id: &str) -> CommandReply {
    if context.is_active() {
        reply
    } else {
        reply.with_context(FlowContext::Idle {
            last_record_id: Some(record_id.to_string()),
        })
    }
}

fn describe(update: &RecordUpdate) -> String {
    match update {
        RecordUpdate::Make(v) => format!("merk → {v}"),
        RecordUpdate::Model(v) => format!("model → {v}"),
        RecordUpdate::Year(v) => format!("tahun → {v}"),
        RecordUpdate::Price(v) => format!("harga → {}", format_price(*v)),
        RecordUpdate::Color(v) => format!("warna → {v}"),
        RecordUpdate::Mileage(v) => format!("km → {v}"),
        RecordUpdate::Status(v) => format!("status → {}", v.label_id()),
    }
}
