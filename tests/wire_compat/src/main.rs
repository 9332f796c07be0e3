fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use javelin_protocol::codec::{self, EventFrame};
    use javelin_protocol::message::{self, MessageFrame};
    use javelin_protocol::{Credentials, Event, JsonEvent, MessageContext, Payload};
    use secrecy::ExposeSecret;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct ChatLine {
        text: String,
    }

    impl Payload for ChatLine {
        const TYPE_ID: &'static str = "chat:line";
    }

    impl Event for ChatLine {}

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    impl Payload for Note {
        const TYPE_ID: &'static str = "test:note";
    }

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Decodes the hex string stored under `field`.
    fn frame_bytes(fixture: &serde_json::Value, field: &str) -> Vec<u8> {
        let hex = fixture[field]
            .as_str()
            .unwrap_or_else(|| panic!("fixture has no {field} string"));
        hex::decode(hex).unwrap_or_else(|e| panic!("bad hex in {field}: {e}"))
    }

    fn str_field<'a>(fixture: &'a serde_json::Value, field: &str) -> &'a str {
        fixture[field]
            .as_str()
            .unwrap_or_else(|| panic!("fixture has no {field} string"))
    }

    fn note_context(fixture: &serde_json::Value) -> MessageContext {
        MessageContext::new(
            str_field(fixture, "namespace"),
            str_field(fixture, "subject"),
            str_field(fixture, "payload_type"),
        )
        .unwrap()
    }

    // --- Event frames ---

    #[test]
    fn fixture_event_frame() {
        let fixture = load_fixture("event_frame.json");
        let expected = frame_bytes(&fixture, "frame");
        let payload: ChatLine = serde_json::from_value(fixture["payload"].clone()).unwrap();

        let encoded = codec::encode_event(&payload).unwrap();
        assert_eq!(hex::encode(&encoded), hex::encode(&expected));

        let frame = EventFrame::parse(&expected).unwrap();
        assert_eq!(frame.type_id, str_field(&fixture, "type_id"));
        assert_eq!(frame.decode::<ChatLine>().unwrap(), payload);
    }

    #[test]
    fn fixture_json_event_frame() {
        let fixture = load_fixture("json_event_frame.json");
        let expected = frame_bytes(&fixture, "frame");
        let event = JsonEvent::new(str_field(&fixture, "name"), str_field(&fixture, "json"));

        assert_eq!(codec::encode_event(&event).unwrap(), expected);

        let frame = EventFrame::parse(&expected).unwrap();
        assert_eq!(frame.type_id, "javelin:json");
        let decoded: JsonEvent = frame.decode().unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.parse::<serde_json::Value>().unwrap()["v"], 1);
    }

    #[test]
    fn event_frame_starts_with_kind_and_big_endian_length() {
        let frame = codec::encode_event(&ChatLine { text: "x".into() }).unwrap();
        assert_eq!(frame[0], 0x01);
        assert_eq!(u16::from_be_bytes([frame[1], frame[2]]), 9);
        assert_eq!(&frame[3..12], b"chat:line");
    }

    // --- Message frames ---

    #[test]
    fn fixture_message_frames() {
        let fixture = load_fixture("message_frame.json");
        let context = note_context(&fixture);
        let payload: Note = serde_json::from_value(fixture["payload"].clone()).unwrap();

        let addressed = frame_bytes(&fixture["addressed"], "frame");
        let encoded = message::encode_message(Some("X"), &context, &payload).unwrap();
        assert_eq!(hex::encode(&encoded), hex::encode(&addressed));

        let broadcast = frame_bytes(&fixture["broadcast"], "frame");
        let encoded = message::encode_message(None, &context, &payload).unwrap();
        assert_eq!(hex::encode(&encoded), hex::encode(&broadcast));

        let parsed = MessageFrame::parse(&broadcast).unwrap();
        assert_eq!(parsed.receiver, None);
        assert_eq!(parsed.context, context);
        assert_eq!(parsed.decode::<Note>().unwrap(), payload);
    }

    #[test]
    fn fixture_rewritten_receiver() {
        let fixture = load_fixture("message_frame.json");
        let addressed = frame_bytes(&fixture["addressed"], "frame");
        let rewritten = frame_bytes(&fixture["rewritten"], "frame");

        let (previous, frame) = message::rewrite_receiver(&addressed, Some("S")).unwrap();
        assert_eq!(previous.as_deref(), Some("X"));
        assert_eq!(hex::encode(&frame), hex::encode(&rewritten));

        let parsed = MessageFrame::parse(&frame).unwrap();
        assert_eq!(parsed.receiver, Some("S"));
    }

    #[test]
    fn message_frame_uses_presence_byte() {
        let fixture = load_fixture("message_frame.json");
        let addressed = frame_bytes(&fixture["addressed"], "frame");
        let broadcast = frame_bytes(&fixture["broadcast"], "frame");

        assert_eq!(&addressed[..5], &[0x02, 0x01, 0x00, 0x01, b'X']);
        assert_eq!(&broadcast[..2], &[0x02, 0x00]);
    }

    // --- Handshake ---

    #[test]
    fn fixture_basic_header() {
        let fixture = load_fixture("basic_header.json");
        let cases = fixture.as_array().expect("fixture should be an array");
        assert!(!cases.is_empty());

        for case in cases {
            let username = str_field(case, "username");
            let password = str_field(case, "password");
            let header = str_field(case, "header");

            let credentials = Credentials::new(username, password).unwrap();
            assert_eq!(credentials.to_header_value(), header);

            let parsed = Credentials::from_header_value(header).unwrap();
            assert_eq!(parsed.username(), username);
            assert_eq!(parsed.password().expose_secret(), password);
        }
    }
}
