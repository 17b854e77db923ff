//! Operator routes for queue statistics and the dead-letter holding areas.

use actix_web::{delete, get, post, web, Responder, Scope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    message::{DeadLetter, MessageAttributes, MessageId},
    service::Service,
};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterView {
    pub message_id: MessageId,
    pub body: String,
    pub attributes: MessageAttributes,
    pub receive_count: u32,
    pub sent_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl From<DeadLetter> for DeadLetterView {
    fn from(dead: DeadLetter) -> Self {
        Self {
            message_id: dead.message_id,
            body: String::from_utf8_lossy(&dead.body).into_owned(),
            attributes: dead.attributes,
            receive_count: dead.receive_count,
            sent_at: dead.sent_at,
            dead_lettered_at: dead.dead_lettered_at,
        }
    }
}

#[get("/queues")]
async fn list_queues(service: web::Data<Service>) -> actix_web::Result<impl Responder> {
    let stats = service.broker().statistics().await?;

    Ok(web::Json(stats))
}

#[get("/queues/{queue}/dead-letters")]
async fn list_dead_letters(
    service: web::Data<Service>,
    path: web::Path<String>,
) -> actix_web::Result<impl Responder> {
    let dead = service.broker().dead_letters(&path).await?;

    Ok(web::Json(
        dead.into_iter()
            .map(DeadLetterView::from)
            .collect::<Vec<_>>(),
    ))
}

#[post("/queues/{queue}/dead-letters/{id}/redrive")]
async fn redrive_dead_letter(
    service: web::Data<Service>,
    path: web::Path<(String, String)>,
) -> actix_web::Result<impl Responder> {
    let (queue, id) = path.into_inner();
    let id = MessageId::from(id);

    service.broker().redrive(&queue, &id).await?;
    tracing::info!(queue = %queue, message_id = %id, "Redrove dead letter");

    Ok("OK")
}

#[delete("/queues/{queue}/dead-letters/{id}")]
async fn discard_dead_letter(
    service: web::Data<Service>,
    path: web::Path<(String, String)>,
) -> actix_web::Result<impl Responder> {
    let (queue, id) = path.into_inner();
    let id = MessageId::from(id);

    service.broker().discard(&queue, &id).await?;
    tracing::info!(queue = %queue, message_id = %id, "Discarded dead letter");

    Ok("OK")
}

pub fn service() -> Scope {
    web::scope("/admin")
        .service(list_queues)
        .service(list_dead_letters)
        .service(redrive_dead_letter)
        .service(discard_dead_letter)
}
