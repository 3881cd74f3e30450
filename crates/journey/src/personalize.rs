//! Per-lead message rendering using `{{variable}}` placeholders.

use rand::Rng;

use campaign_core::sequence::{MessageVariant, Node};
use campaign_core::types::{ActionData, Lead};

/// Substitutes the lead's fields into a template. Unknown placeholders are
/// left as written; missing optional fields render empty.
pub fn render(template: &str, lead: &Lead) -> String {
    let variables: [(&str, &str); 4] = [
        ("first_name", lead.first_name.as_str()),
        ("last_name", lead.last_name.as_str()),
        ("company", lead.company.as_deref().unwrap_or_default()),
        ("position", lead.position.as_deref().unwrap_or_default()),
    ];

    let mut result = template.to_string();
    for (name, value) in variables {
        let placeholder = format!("{{{{{}}}}}", name);
        result = result.replace(&placeholder, value);
    }
    result
}

/// Picks a variant index in proportion to its weight. Zero weights are
/// never picked unless every weight is zero, in which case the first wins.
pub fn choose_variant<R: Rng + ?Sized>(variants: &[MessageVariant], rng: &mut R) -> Option<usize> {
    if variants.is_empty() {
        return None;
    }
    let total: u64 = variants.iter().map(|v| u64::from(v.weight)).sum();
    if total == 0 {
        return Some(0);
    }

    let mut roll = rng.gen_range(0..total);
    for (idx, variant) in variants.iter().enumerate() {
        let weight = u64::from(variant.weight);
        if roll < weight {
            return Some(idx);
        }
        roll -= weight;
    }
    Some(variants.len() - 1)
}

/// Builds the payload an action node sends for one lead.
pub fn action_data<R: Rng + ?Sized>(node: &Node, lead: Option<&Lead>, rng: &mut R) -> ActionData {
    let fill = |text: &str| match lead {
        Some(lead) => render(text, lead),
        None => text.to_string(),
    };

    match node {
        Node::SendInvite { message } if !message.is_empty() => ActionData {
            message: Some(fill(message)),
            ..ActionData::default()
        },
        Node::SendMessage { variants } => match choose_variant(variants, rng) {
            Some(idx) => ActionData {
                message: Some(fill(&variants[idx].body)),
                subject: None,
                variant: Some(idx),
            },
            None => ActionData::default(),
        },
        Node::SendEmail { subject, body } => ActionData {
            message: Some(fill(body)),
            subject: Some(fill(subject)),
            variant: None,
        },
        _ => ActionData::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn lead() -> Lead {
        let mut lead = Lead::new("Ada", "Lovelace", "https://example.com/in/ada");
        lead.company = Some("Analytical Engines".into());
        lead
    }

    #[test]
    fn test_render_fills_known_fields() {
        let out = render(
            "Hi {{first_name}} {{last_name}} at {{company}} ({{position}}) {{unknown}}",
            &lead(),
        );
        assert_eq!(out, "Hi Ada Lovelace at Analytical Engines () {{unknown}}");
    }

    #[test]
    fn test_choose_variant_respects_weights() {
        let variants = vec![
            MessageVariant { body: "a".into(), weight: 0 },
            MessageVariant { body: "b".into(), weight: 3 },
            MessageVariant { body: "c".into(), weight: 1 },
        ];
        let mut rng = StdRng::seed_from_u64(7);
        let mut counts = [0u32; 3];
        for _ in 0..2000 {
            counts[choose_variant(&variants, &mut rng).unwrap()] += 1;
        }
        assert_eq!(counts[0], 0);
        assert!(counts[1] > counts[2] * 2);
        assert!(counts[2] > 0);
    }

    #[test]
    fn test_choose_variant_edge_cases() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(choose_variant(&[], &mut rng), None);
        let zeros = vec![MessageVariant { body: "x".into(), weight: 0 }];
        assert_eq!(choose_variant(&zeros, &mut rng), Some(0));
    }

    #[test]
    fn test_action_data_for_message_records_variant() {
        let node = Node::SendMessage {
            variants: vec![MessageVariant {
                body: "Thanks {{first_name}}!".into(),
                weight: 1,
            }],
        };
        let mut rng = StdRng::seed_from_u64(3);
        let data = action_data(&node, Some(&lead()), &mut rng);
        assert_eq!(data.message.as_deref(), Some("Thanks Ada!"));
        assert_eq!(data.variant, Some(0));
    }

    #[test]
    fn test_action_data_for_email_and_blank_invite() {
        let mut rng = StdRng::seed_from_u64(3);
        let email = Node::SendEmail {
            subject: "Hello {{company}}".into(),
            body: "Dear {{first_name}}".into(),
        };
        let data = action_data(&email, Some(&lead()), &mut rng);
        assert_eq!(data.subject.as_deref(), Some("Hello Analytical Engines"));
        assert_eq!(data.message.as_deref(), Some("Dear Ada"));

        let invite = Node::SendInvite { message: String::new() };
        assert_eq!(action_data(&invite, Some(&lead()), &mut rng), ActionData::default());
    }
}
