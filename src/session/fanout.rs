use super::connection::ConnectionId;
use super::protocol::ServerMessage;
use super::registry::LiveRoom;

/// Send `message` to the room's master and every attached participant,
/// skipping `exclude`. Delivery is best effort with no retry; returns how
/// many sockets accepted the frame.
pub fn broadcast(room: &LiveRoom, message: &ServerMessage, exclude: Option<ConnectionId>) -> usize {
    let master = room.master.iter();
    let players = room
        .participants
        .values()
        .filter_map(|participant| participant.connection.as_ref());

    master
        .chain(players)
        .filter(|conn| Some(conn.id()) != exclude)
        .filter(|conn| conn.send(message.clone()))
        .count()
}

/// Like [`broadcast`] but skips the master connection
pub fn broadcast_to_players(room: &LiveRoom, message: &ServerMessage) -> usize {
    room.participants
        .values()
        .filter_map(|participant| participant.connection.as_ref())
        .filter(|conn| conn.send(message.clone()))
        .count()
}
