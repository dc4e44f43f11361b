use axum::extract::ws::{Message, WebSocket};
use consulta_common::protocol::chat::ChatFrame;

pub fn decode_frame(raw: &str) -> Result<ChatFrame, serde_json::Error> {
    serde_json::from_str::<ChatFrame>(raw)
}

pub fn encode_frame(frame: &ChatFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

pub async fn send_frame(socket: &mut WebSocket, frame: &ChatFrame) -> Result<(), ()> {
    let encoded = encode_frame(frame).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}
