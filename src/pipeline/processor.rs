//! Orchestrator: turns one inbound chat message into exactly one reply.
//!
//! Flow:
//! 1. Self-loop check and duplicate-greeting guard
//! 2. Identity resolution and conversation lookup (role is sticky)
//! 3. Flow continuation, interruption, or intent classification
//! 4. Routing: verification, staff commands, templates, or the AI responder
//!    behind the health gate
//! 5. Delivery and conversation update
//!
//! Any error after the sender is known is logged and answered with a
//! generic apology; the participant is never left without a reply.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::channels::delivery::Envelope;
use crate::channels::{Attachment, ChannelGateway, DeliveryLayer, DeliveryReport};
use crate::config::OrchestratorConfig;
use crate::error::{Error, LlmError};
use crate::identity::{
    IdentityResolver, ParsedAddress, RejectReason, ResolvedIdentity, Role, StaffRole,
    VerificationOutcome,
};
use crate::llm::{
    self, GenerateRequest, HistoryLine, Responder, TOOL_EDIT_RECORD_FIELD, TOOL_SEND_RECORD_PHOTOS,
    TOOL_START_RECORD_FLOW, ToolCall,
};
use crate::pipeline::commands::CommandHandler;
use crate::pipeline::dedup::{DedupGuard, sender_key};
use crate::pipeline::fields::{RecordFields, format_price, parse_price};
use crate::pipeline::flow::{FlowContext, FlowEngine, FlowState};
use crate::pipeline::health::HealthMonitor;
use crate::pipeline::rules::{
    IntentClassifier, flow_interrupt, is_bare_greeting, verification_claim,
};
use crate::pipeline::templates::{self, TimeOfDay};
use crate::pipeline::types::{
    Classification, InboundMessage, Intent, ProcessingOutcome, ProcessingResult, SideIntent,
};
use crate::store::{
    Conversation, ConversationPatch, ConversationStatus, NewConversation, NewMessage,
    RecordStatus, SenderKind, Storage,
};

/// Records listed in the responder's system prompt.
const PROMPT_INVENTORY_LIMIT: usize = 15;

/// What a routed turn wants to send and change.
struct Reply {
    text: String,
    attachments: Vec<Attachment>,
    sender_kind: SenderKind,
    status: Option<ConversationStatus>,
}

impl Reply {
    fn bot(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
            sender_kind: SenderKind::Bot,
            status: None,
        }
    }

    fn with_status(mut self, status: ConversationStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Mutable per-turn state threaded through routing.
struct Turn<'a> {
    message: &'a InboundMessage,
    inbound_id: String,
    sender: &'a ParsedAddress,
    conversation: &'a Conversation,
    role: Role,
    context: FlowContext,
    patch: ConversationPatch,
}

impl Turn<'_> {
    fn text(&self) -> &str {
        self.message.content.trim()
    }

    fn attachment(&self) -> Option<&str> {
        self.message.attachment.as_ref().map(|a| a.file_ref.as_str())
    }

    fn tenant(&self) -> &str {
        &self.message.tenant_id
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn Storage>,
    gateway: Arc<dyn ChannelGateway>,
    identity: IdentityResolver,
    classifier: IntentClassifier,
    flows: Arc<FlowEngine>,
    commands: CommandHandler,
    dedup: DedupGuard,
    health: HealthMonitor,
    responder: Arc<dyn Responder>,
    delivery: DeliveryLayer,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn Storage>,
        responder: Arc<dyn Responder>,
        gateway: Arc<dyn ChannelGateway>,
    ) -> Self {
        let flows = Arc::new(FlowEngine::new(store.clone(), config.flow.idle_timeout));
        Self {
            identity: IdentityResolver::new(store.clone(), config.identity.clone()),
            classifier: IntentClassifier::default_rules(),
            commands: CommandHandler::new(store.clone(), flows.clone(), config.utc_offset_hours),
            flows,
            dedup: DedupGuard::new(&config.dedup),
            health: HealthMonitor::new(config.health.clone()),
            delivery: DeliveryLayer::new(gateway.clone(), store.clone(), config.delivery.clone()),
            responder,
            gateway,
            store,
            config,
        }
    }

    /// Responder circuit breaker, for administrative overrides.
    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    /// Process one inbound message end to end.
    pub async fn process(&self, message: InboundMessage) -> ProcessingResult {
        info!(
            id = %message.id,
            tenant = %message.tenant_id,
            sender = %message.sender,
            has_attachment = message.has_attachment(),
            "Processing inbound message"
        );

        let Some(sender) = self.identity.parse(&message.sender) else {
            warn!(sender = %message.sender, "Unparseable sender address, discarding");
            return ProcessingResult::discarded(ProcessingOutcome::Unaddressable);
        };

        if self.is_self_loop(&sender, &message.channel_account) {
            debug!(sender = %sender.key(), "Self-loop message discarded");
            return ProcessingResult::discarded(ProcessingOutcome::SelfLoop);
        }

        let suppressed = if is_bare_greeting(&message.content) && !message.has_attachment() {
            let key = sender_key(&message.tenant_id, &message.channel_account, sender.key());
            self.dedup
                .check_and_record(&key, message.received_at.timestamp_millis())
                .await
        } else {
            false
        };

        let (resolved, conversation) = match self.open_conversation(&message, &sender).await {
            Ok(opened) => opened,
            Err(e) => return self.apologize(&message, None, e).await,
        };

        match self
            .handle_turn(&message, &sender, resolved, &conversation, suppressed)
            .await
        {
            Ok(result) => result,
            Err(e) => self.apologize(&message, Some(&conversation), e).await,
        }
    }

    fn is_self_loop(&self, sender: &ParsedAddress, channel_account: &str) -> bool {
        match sender {
            ParsedAddress::Canonical(address) => {
                self.identity.normalize(channel_account).as_deref() == Some(address.as_str())
            }
            ParsedAddress::Alias(_) => false,
        }
    }

    async fn open_conversation(
        &self,
        message: &InboundMessage,
        sender: &ParsedAddress,
    ) -> Result<(ResolvedIdentity, Conversation), Error> {
        let resolved = self
            .identity
            .resolve(&message.tenant_id, &message.channel_account, sender)
            .await?;

        if let Some(conversation) = self
            .store
            .get_conversation(&message.tenant_id, &message.channel_account, &resolved.participant)
            .await?
        {
            return Ok((resolved, conversation));
        }

        let conversation = self
            .store
            .create_conversation(NewConversation {
                tenant_id: message.tenant_id.clone(),
                channel_account: message.channel_account.clone(),
                participant: resolved.participant.clone(),
                is_staff: resolved.role.is_staff(),
                staff_role: resolved.role.staff_level(),
                linked_canonical: resolved.canonical.clone().filter(|_| resolved.is_alias),
            })
            .await?;
        info!(
            conversation = %conversation.id,
            participant = %conversation.participant,
            role = resolved.role.tag(),
            "Conversation created"
        );
        Ok((resolved, conversation))
    }

    async fn handle_turn(
        &self,
        message: &InboundMessage,
        sender: &ParsedAddress,
        resolved: ResolvedIdentity,
        conversation: &Conversation,
        suppressed: bool,
    ) -> Result<ProcessingResult, Error> {
        let now = message.received_at;
        let inbound_id = self
            .store
            .append_message(NewMessage::inbound(
                &message.tenant_id,
                &conversation.id,
                &resolved.participant,
                &message.content,
                message.attachment.as_ref().map(|a| a.file_ref.as_str()),
            ))
            .await?;

        let mut turn = Turn {
            message,
            inbound_id,
            sender,
            conversation,
            role: sticky_role(resolved.role, conversation),
            context: conversation.flow.clone(),
            patch: ConversationPatch {
                last_message_at: Some(now),
                ..Default::default()
            },
        };
        if let Role::Staff(level) = resolved.role
            && (!conversation.is_staff || conversation.staff_role != Some(level))
        {
            turn.patch.is_staff = Some(true);
            turn.patch.staff_role = Some(level);
        }

        if suppressed {
            info!(conversation = %conversation.id, "Duplicate greeting suppressed");
            self.store
                .update_conversation(&conversation.id, &turn.patch)
                .await?;
            return Ok(ProcessingResult {
                outcome: ProcessingOutcome::Suppressed,
                conversation_id: Some(conversation.id.clone()),
                intent: None,
                confidence: None,
                role: Some(turn.role),
                response: None,
                delivery: None,
            });
        }

        let mut notice = None;
        if self
            .flows
            .is_expired(&turn.context, conversation.last_message_at, now)
        {
            info!(
                conversation = %conversation.id,
                state = %turn.context.state(),
                "Flow expired after inactivity"
            );
            turn.context = turn.context.pruned();
            notice = Some(templates::flow_expired().to_string());
        }

        let (classification, interrupted) = self.classify(&mut turn);
        let intent = classification.intent;
        info!(
            conversation = %conversation.id,
            intent = %intent,
            confidence = classification.confidence,
            reason = %classification.reason,
            role = turn.role.tag(),
            "Message classified"
        );

        self.store
            .update_message_classification(
                &turn.inbound_id,
                intent.as_str(),
                classification.confidence,
                if turn.role.is_staff() {
                    SenderKind::Staff
                } else {
                    SenderKind::Customer
                },
                turn.role.staff_level(),
            )
            .await?;

        let mut reply = self.route(&mut turn, intent).await?;
        if interrupted {
            reply.text = templates::flow_cancelled(&reply.text);
        }
        if let Some(notice) = notice {
            reply.text = format!("{notice}\n\n{}", reply.text);
        }

        let envelope = Envelope {
            tenant_id: message.tenant_id.clone(),
            conversation_id: conversation.id.clone(),
            from: message.channel_account.clone(),
            destination: message.sender.clone(),
            sender_kind: reply.sender_kind,
            intent: Some(intent.as_str().to_string()),
            recipient_level: turn.role.staff_level(),
        };
        let report = self
            .delivery
            .send(&envelope, &reply.text, &reply.attachments)
            .await;

        turn.patch.last_intent = Some(intent.as_str().to_string());
        turn.patch.status = reply.status;
        if turn.context != conversation.flow {
            turn.patch.flow = Some(turn.context.clone());
        }
        // Delivery already happened, so a failed patch is only logged.
        if let Err(e) = self
            .store
            .update_conversation(&conversation.id, &turn.patch)
            .await
        {
            error!(
                conversation = %conversation.id,
                error = %e,
                "Conversation update failed after delivery"
            );
        }

        Ok(ProcessingResult {
            outcome: ProcessingOutcome::Replied,
            conversation_id: Some(conversation.id.clone()),
            intent: Some(intent),
            confidence: Some(classification.confidence),
            role: Some(turn.role),
            response: Some(reply.text),
            delivery: Some(report),
        })
    }

    /// Decide the intent. Returns whether an active flow was interrupted.
    fn classify(&self, turn: &mut Turn<'_>) -> (Classification, bool) {
        let message = turn.message;
        let text = message.content.trim();
        let has_attachment = message.has_attachment();

        if turn.context.is_active() {
            if let Some(interrupt) = flow_interrupt(text) {
                info!(
                    conversation = %turn.conversation.id,
                    state = %turn.context.state(),
                    interrupt = ?interrupt,
                    photos = turn.context.photo_count(),
                    "Flow interrupted"
                );
                turn.context = FlowContext::cleared();
                let classification = if turn.role.is_staff() {
                    Classification::new(Intent::StaffHelp, 0.9, "flow interrupted")
                } else {
                    self.classifier
                        .classify(text, has_attachment, turn.role, FlowState::Idle)
                };
                return (classification, true);
            }

            // A slash command ends the flow but keeps the record it created,
            // so `/edit harga 145jt` still knows what to edit. Only unsaved
            // draft data is cancelled.
            let explicit = self
                .classifier
                .classify(text, has_attachment, turn.role, FlowState::Idle);
            if text.starts_with('/')
                && (explicit.intent.is_staff_command() || explicit.intent == Intent::VerifyIdentity)
            {
                let discarded_draft = turn.context.record_id().is_none();
                turn.context = turn.context.pruned();
                return (explicit, discarded_draft);
            }

            return (
                Classification::new(Intent::StaffContinueFlow, 0.99, "active flow"),
                false,
            );
        }

        (
            self.classifier
                .classify(text, has_attachment, turn.role, turn.context.state()),
            false,
        )
    }

    async fn route(&self, turn: &mut Turn<'_>, intent: Intent) -> Result<Reply, Error> {
        match intent {
            Intent::VerifyIdentity => self.verify(turn).await,
            Intent::StaffContinueFlow => {
                let step = self
                    .flows
                    .advance(turn.tenant(), turn.context.clone(), turn.text(), turn.attachment())
                    .await?;
                if step.failed {
                    warn!(conversation = %turn.conversation.id, "Flow step failed, state kept");
                }
                turn.context = step.context;
                Ok(Reply::bot(step.reply))
            }
            intent if intent.is_staff_command() => {
                let reply = self
                    .commands
                    .handle(
                        turn.tenant(),
                        intent,
                        turn.text(),
                        turn.attachment(),
                        turn.role,
                        &turn.context,
                    )
                    .await?;
                if let Some(context) = reply.context {
                    turn.context = context;
                }
                Ok(Reply::bot(reply.text))
            }
            Intent::CustomerGreeting => {
                let tod = TimeOfDay::at(turn.message.received_at, self.config.utc_offset_hours);
                Ok(Reply::bot(templates::customer_greeting(
                    tod,
                    &self.config.assistant_name,
                    &self.config.business_name,
                )))
            }
            Intent::CustomerClosing => {
                Ok(Reply::bot(templates::closing()).with_status(ConversationStatus::Closed))
            }
            intent if intent.is_conversational() => self.respond(turn).await,
            _ => Ok(Reply::bot(templates::responder_fallback())),
        }
    }

    async fn verify(&self, turn: &mut Turn<'_>) -> Result<Reply, Error> {
        let outcome = match verification_claim(turn.text()) {
            Some(claim) => {
                self.identity
                    .verify_claim(turn.tenant(), turn.sender, &claim)
                    .await?
            }
            None => VerificationOutcome::Rejected(RejectReason::InvalidAddress),
        };

        match &outcome {
            VerificationOutcome::Verified { canonical, role }
            | VerificationOutcome::AlreadyVerified { canonical, role } => {
                info!(
                    conversation = %turn.conversation.id,
                    canonical = %canonical,
                    level = %role,
                    "Conversation upgraded to staff"
                );
                turn.role = Role::Staff(*role);
                turn.patch.is_staff = Some(true);
                turn.patch.staff_role = Some(*role);
                if turn.sender.is_alias() {
                    turn.patch.linked_canonical = Some(canonical.clone());
                }
            }
            VerificationOutcome::Rejected(reason) => {
                warn!(
                    conversation = %turn.conversation.id,
                    reason = %reason,
                    "Verification rejected"
                );
            }
        }
        Ok(Reply::bot(templates::verification(&outcome)))
    }

    /// Conversational reply from the AI responder, behind the health gate.
    async fn respond(&self, turn: &mut Turn<'_>) -> Result<Reply, Error> {
        let tenant = turn.tenant().to_string();
        let check = self.health.can_process(&tenant).await;
        if !check.can_process && !turn.role.is_staff() {
            warn!(
                tenant = %tenant,
                status = %check.status,
                reason = check.reason.as_deref().unwrap_or(""),
                "Responder disabled, sending fallback"
            );
            return Ok(Reply::bot(templates::responder_fallback()));
        }

        let request = self.build_request(turn).await?;
        let timeout = self.config.responder_timeout;
        let result = match tokio::time::timeout(timeout, self.responder.generate(request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout {
                provider: self.responder.model_name().to_string(),
                timeout,
            }),
        };

        let response = match result {
            Ok(response) => {
                self.health.track_success(&tenant).await;
                response
            }
            Err(e) => {
                let status = self.health.track_error(&tenant, &e.to_string()).await;
                warn!(
                    conversation = %turn.conversation.id,
                    error = %e,
                    health = %status,
                    "Responder failed, escalating"
                );
                return Ok(Reply::bot(templates::responder_fallback())
                    .with_status(ConversationStatus::Escalated));
            }
        };

        let (text, uncertain) = llm::strip_escalation(&response.text);
        let mut reply = Reply {
            text,
            attachments: Vec::new(),
            sender_kind: SenderKind::Ai,
            status: None,
        };
        if uncertain {
            info!(conversation = %turn.conversation.id, "Responder asked for a human, escalating");
            reply.status = Some(ConversationStatus::Escalated);
        }

        let mut refused = false;
        for call in &response.tool_calls {
            let Some(side_intent) = side_intent(call) else {
                warn!(tool = %call.name, "Unrecognised tool call ignored");
                continue;
            };
            if side_intent.requires_staff() && !turn.role.is_staff() {
                info!(
                    conversation = %turn.conversation.id,
                    side_intent = side_intent.name(),
                    "Staff-only side intent discarded"
                );
                refused = true;
                continue;
            }
            self.apply_side_intent(turn, side_intent, &mut reply).await?;
        }
        if refused {
            append_line(&mut reply.text, templates::staff_only());
        }
        Ok(reply)
    }

    async fn build_request(&self, turn: &Turn<'_>) -> Result<GenerateRequest, Error> {
        let limit = self.config.history_limit;
        let mut history: Vec<HistoryLine> = self
            .store
            .recent_messages(&turn.conversation.id, limit + 1)
            .await?
            .into_iter()
            .filter(|m| m.id != turn.inbound_id && !m.content.trim().is_empty())
            .map(|m| HistoryLine {
                label: m.display_label(turn.role.is_staff(), &self.config.assistant_name),
                content: m.content,
            })
            .collect();
        if history.len() > limit {
            history.drain(..history.len() - limit);
        }

        let records = self
            .store
            .list_records(turn.tenant(), Some(RecordStatus::Available), PROMPT_INVENTORY_LIMIT)
            .await?;
        let inventory: String = records
            .iter()
            .map(|r| {
                format!(
                    "- {} {} {} ({} foto)\n",
                    r.id,
                    r.title(),
                    format_price(r.price),
                    r.photos.len()
                )
            })
            .collect();

        Ok(GenerateRequest {
            system_prompt: llm::build_system_prompt(
                &self.config.assistant_name,
                &self.config.business_name,
                turn.role.is_staff(),
                &inventory,
            ),
            user_prompt: llm::build_user_prompt(&history, turn.text()),
            timeout: self.config.responder_timeout,
            tools: llm::tool_definitions(),
        })
    }

    async fn apply_side_intent(
        &self,
        turn: &mut Turn<'_>,
        side_intent: SideIntent,
        reply: &mut Reply,
    ) -> Result<(), Error> {
        info!(
            conversation = %turn.conversation.id,
            side_intent = side_intent.name(),
            "Applying responder side intent"
        );
        match side_intent {
            SideIntent::StartRecordFlow { fields } => {
                let step = self
                    .flows
                    .start(turn.tenant(), fields, turn.attachment())
                    .await?;
                turn.context = step.context;
                append_line(&mut reply.text, &step.reply);
            }
            SideIntent::EditRecordField {
                record_id,
                field,
                value,
            } => {
                let Some(level) = turn.role.staff_level() else {
                    return Ok(());
                };
                let Some(record_id) = record_id.or_else(|| turn.context.record_id().map(String::from))
                else {
                    append_line(&mut reply.text, "Sebutkan ID mobil yang ingin diubah.");
                    return Ok(());
                };
                let edit = self
                    .commands
                    .apply_edit(turn.tenant(), &record_id, &field, &value, level, &turn.context)
                    .await?;
                if let Some(context) = edit.context {
                    turn.context = context;
                }
                append_line(&mut reply.text, &edit.text);
            }
            SideIntent::SendRecordPhotos { record_id } => {
                match self.store.get_record(turn.tenant(), &record_id).await? {
                    Some(record) if !record.photos.is_empty() => {
                        let title = format!("{} - {}", record.title(), format_price(record.price));
                        reply.attachments.extend(record.photos.iter().enumerate().map(
                            |(i, url)| Attachment::image(url.clone(), (i == 0).then(|| title.clone())),
                        ));
                    }
                    Some(record) => {
                        append_line(
                            &mut reply.text,
                            &format!("Foto {} belum tersedia.", record.title()),
                        );
                    }
                    None => {
                        append_line(
                            &mut reply.text,
                            &format!("Mobil dengan ID {record_id} tidak ditemukan."),
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Last-resort reply after an internal error.
    async fn apologize(
        &self,
        message: &InboundMessage,
        conversation: Option<&Conversation>,
        err: Error,
    ) -> ProcessingResult {
        error!(
            id = %message.id,
            tenant = %message.tenant_id,
            sender = %message.sender,
            conversation = conversation.map(|c| c.id.as_str()).unwrap_or("-"),
            error = %err,
            "Message processing failed, sending apology"
        );

        let text = templates::apology();
        let delivery = match conversation {
            Some(conversation) => {
                let envelope = Envelope {
                    tenant_id: message.tenant_id.clone(),
                    conversation_id: conversation.id.clone(),
                    from: message.channel_account.clone(),
                    destination: message.sender.clone(),
                    sender_kind: SenderKind::Bot,
                    intent: None,
                    recipient_level: None,
                };
                Some(self.delivery.send(&envelope, text, &[]).await)
            }
            None => match self.gateway.send_text(&message.sender, text).await {
                Ok(receipt) => Some(DeliveryReport {
                    text_sent: true,
                    text_message_id: receipt.message_id,
                    ..Default::default()
                }),
                Err(e) => {
                    error!(error = %e, "Apology could not be delivered");
                    None
                }
            },
        };

        ProcessingResult {
            outcome: ProcessingOutcome::Failed,
            conversation_id: conversation.map(|c| c.id.clone()),
            intent: None,
            confidence: None,
            role: None,
            response: Some(text.to_string()),
            delivery,
        }
    }
}

/// A staff conversation stays staff even when this message resolves as a customer.
fn sticky_role(resolved: Role, conversation: &Conversation) -> Role {
    match resolved {
        Role::Staff(level) => Role::Staff(level),
        Role::Customer if conversation.is_staff => {
            Role::Staff(conversation.staff_role.unwrap_or(StaffRole::Operator))
        }
        Role::Customer => Role::Customer,
    }
}

fn append_line(text: &mut String, line: &str) {
    if line.is_empty() {
        return;
    }
    if !text.is_empty() {
        text.push_str("\n\n");
    }
    text.push_str(line);
}

/// Map a responder tool call onto a side intent.
fn side_intent(call: &ToolCall) -> Option<SideIntent> {
    let args = &call.arguments;
    let string = |key: &str| {
        args.get(key)
            .and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.trim().to_string()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
    };

    match call.name.as_str() {
        TOOL_START_RECORD_FLOW => {
            let fields = RecordFields {
                make: string("make"),
                model: string("model"),
                year: args
                    .get("year")
                    .and_then(|v| v.as_i64().or_else(|| v.as_str()?.parse().ok()))
                    .and_then(|y| i32::try_from(y).ok()),
                price: args.get("price").and_then(|v| match v {
                    serde_json::Value::Number(n) => n.as_i64().map(Decimal::from),
                    serde_json::Value::String(s) => parse_price(s),
                    _ => None,
                }),
                color: string("color"),
                mileage_km: args
                    .get("mileageKm")
                    .and_then(serde_json::Value::as_u64)
                    .and_then(|km| u32::try_from(km).ok()),
            };
            Some(SideIntent::StartRecordFlow { fields })
        }
        TOOL_EDIT_RECORD_FIELD => Some(SideIntent::EditRecordField {
            record_id: string("recordId"),
            field: string("field")?,
            value: string("value")?,
        }),
        TOOL_SEND_RECORD_PHOTOS => Some(SideIntent::SendRecordPhotos {
            record_id: string("recordId")?,
        }),
        _ => None,
    }
}
