use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Serialize;

use huddle_proto::ParticipantInfo;

use crate::ws::RelayState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    active_rooms: usize,
}

#[derive(Debug, Serialize)]
pub struct RoomStatus {
    exists: bool,
    participants: Vec<ParticipantInfo>,
}

pub async fn health_check(State(state): State<RelayState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        active_rooms: state.registry.room_count(),
    })
}

pub async fn room_status(
    Path(room_id): Path<String>,
    State(state): State<RelayState>,
) -> Json<RoomStatus> {
    let participants = state.registry.participants(&room_id);
    Json(RoomStatus {
        exists: participants.is_some(),
        participants: participants.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Participant;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn health_reports_live_room_count() {
        let state = RelayState::new();
        let body = health_check(State(state.clone())).await.0;
        assert_eq!(body.status, "ok");
        assert_eq!(body.active_rooms, 0);

        let (sender, _rx) = mpsc::unbounded_channel();
        state
            .registry
            .create_or_join(
                "r1",
                Participant {
                    info: ParticipantInfo {
                        user_id: "a".into(),
                        username: "A".into(),
                        connection_id: "c-a".into(),
                    },
                    sender,
                },
            )
            .unwrap();

        let body = health_check(State(state)).await.0;
        assert_eq!(body.active_rooms, 1);
    }

    #[tokio::test]
    async fn room_status_distinguishes_missing_rooms() {
        let state = RelayState::new();
        let body = room_status(Path("r1".into()), State(state.clone())).await.0;
        assert!(!body.exists);
        assert!(body.participants.is_empty());

        let (sender, _rx) = mpsc::unbounded_channel();
        state
            .registry
            .create_or_join(
                "r1",
                Participant {
                    info: ParticipantInfo {
                        user_id: "a".into(),
                        username: "A".into(),
                        connection_id: "c-a".into(),
                    },
                    sender,
                },
            )
            .unwrap();

        let body = room_status(Path("r1".into()), State(state)).await.0;
        assert!(body.exists);
        assert_eq!(body.participants.len(), 1);
        assert_eq!(body.participants[0].user_id, "a");
    }
}
