//! Tests for message types.

use super::*;

mod topic_name {
    use super::*;

    #[test]
    fn test_valid_topic_names() {
        for name in ["events", "task-runs", "my_topic", "prefect.events.v1", "a"] {
            let topic = TopicName::new(name.to_string()).unwrap();
            assert_eq!(topic.as_str(), name);
            assert_eq!(topic.to_string(), name);
        }
    }

    #[test]
    fn test_empty_topic_rejected() {
        assert!(matches!(
            TopicName::new(String::new()),
            Err(ValidationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_overlong_topic_rejected() {
        assert!(TopicName::new("a".repeat(261)).is_err());
        assert!(TopicName::new("a".repeat(260)).is_ok());
    }

    #[test]
    fn test_glob_characters_rejected() {
        for name in ["events*", "ev?nts", "events[1]", "my topic", "a/b"] {
            assert!(
                matches!(
                    TopicName::new(name.to_string()),
                    Err(ValidationError::InvalidFormat { .. })
                ),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn test_hyphen_placement_rejected() {
        assert!(TopicName::new("-events".to_string()).is_err());
        assert!(TopicName::new("events-".to_string()).is_err());
        assert!(TopicName::new("my--events".to_string()).is_err());
    }

    #[test]
    fn test_from_str() {
        let topic: TopicName = "events".parse().unwrap();
        assert_eq!(topic.as_str(), "events");
        assert!("bad topic".parse::<TopicName>().is_err());
    }
}

mod messages {
    use super::*;

    #[test]
    fn test_message_accessors() {
        let message = Message::new("hello, world", HashMap::new()).with_attribute("howdy", "partner");

        assert_eq!(message.data(), &Bytes::from("hello, world"));
        assert_eq!(message.attribute("howdy"), Some("partner"));
        assert_eq!(message.attribute("missing"), None);
        assert_eq!(message.attributes().len(), 1);
    }

    #[test]
    fn test_captured_message_from_message() {
        let message = Message::new(Bytes::from_static(b"payload"), HashMap::new())
            .with_attribute("id", "abc");

        let captured = CapturedMessage::from(message);
        assert_eq!(captured.data, Bytes::from_static(b"payload"));
        assert_eq!(captured.attributes.get("id").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_delivery_redelivery_flag() {
        let delivery = Delivery {
            message: Message::new("x", HashMap::new()),
            receipt: Receipt::new("1"),
            delivery_count: 1,
        };
        assert!(!delivery.is_redelivery());

        let again = Delivery {
            delivery_count: 2,
            ..delivery
        };
        assert!(again.is_redelivery());
        assert_eq!(again.receipt.as_str(), "1");
    }
}
