use tracing::info;
use uuid::Uuid;

use crate::config::CONFIG;

#[derive(Debug, Clone, Copy)]
pub struct Tariff {
    pub days: u32,
    pub amount: u32,
}

impl Tariff {
    /// Inline-button label, e.g. "3 месяца - 799₽".
    pub fn label(&self) -> String {
        let tenure = match self.days {
            30 => "1 месяц".to_string(),
            90 => "3 месяца".to_string(),
            365 => "12 месяцев".to_string(),
            days => format!("{days} дней"),
        };
        format!("{tenure} - {}₽", self.amount)
    }
}

pub fn tariffs() -> [Tariff; 3] {
    [
        Tariff {
            days: 30,
            amount: CONFIG.price_30_days,
        },
        Tariff {
            days: 90,
            amount: CONFIG.price_90_days,
        },
        Tariff {
            days: 365,
            amount: CONFIG.price_365_days,
        },
    ]
}

/// Stub for the payment integration: fabricates a checkout URL. A real
/// integration would call the payment provider's API here and activate the
/// subscription from its webhook.
pub fn generate_payment_link(user_id: i64, tariff: Tariff) -> String {
    let payment_id = Uuid::new_v4();
    info!("Generated payment link {payment_id} for user {user_id}");
    format!(
        "https://payment-system.example/pay/{payment_id}?amount={}&days={}",
        tariff.amount, tariff.days
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_link_embeds_amount_and_tenure() {
        let link = generate_payment_link(
            1,
            Tariff {
                days: 30,
                amount: 299,
            },
        );
        assert!(link.starts_with("https://payment-system.example/pay/"));
        assert!(link.ends_with("?amount=299&days=30"));
    }

    #[test]
    fn tariff_labels_spell_out_the_tenure() {
        let label = Tariff {
            days: 90,
            amount: 799,
        }
        .label();
        assert_eq!(label, "3 месяца - 799₽");

        let odd = Tariff {
            days: 14,
            amount: 100,
        }
        .label();
        assert_eq!(odd, "14 дней - 100₽");
    }
}
