use chrono::NaiveDate;
use rent_advance_engine::*;
use rust_decimal_macros::dec;

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn main() -> anyhow::Result<()> {
    println!("🏠 Rent Advance Nightly Sweep Demo\n");

    let mut engine = AdvanceEngine::new(EngineConfig::default())?;

    engine.add_contract(Contract {
        id: ContractId(1),
        monthly_rent: dec!(150000),
        monthly_charges: dec!(10000),
        start_date: ymd(2024, 1, 1),
        active: true,
        terminated: false,
    });
    engine.add_contract(Contract {
        id: ContractId(2),
        monthly_rent: dec!(100000),
        monthly_charges: dec!(0),
        start_date: ymd(2023, 11, 1),
        active: true,
        terminated: false,
    });

    // Contract 1: two advances, the second continues after the first.
    for (id, amount, date) in [
        (1, dec!(450000), ymd(2024, 1, 4)),
        (2, dec!(400000), ymd(2024, 2, 12)),
    ] {
        let outcome = engine.record_payment(
            PaymentEvent {
                id: PaymentId(id),
                contract_id: ContractId(1),
                amount,
                date,
                kind: PaymentKind::Advance,
                status: PaymentStatus::Valid,
            },
            date,
        )?;
        if let Some(outcome) = outcome {
            let plan = engine.book().plan(outcome.plan_id)?;
            println!(
                "  {} → {} ({} mois, reste {})",
                outcome.plan_id,
                plan.months_label(),
                plan.months_covered,
                plan.remainder
            );
        }
    }

    // Contract 2: an advance for chosen months, entered at the desk.
    let manual = engine.create_advance(
        NewAdvance {
            contract_id: ContractId(2),
            amount: dec!(250000),
            date: ymd(2024, 1, 20),
            selection: AdvanceSelection::Manual(vec![
                ymd(2024, 2, 1),
                ymd(2024, 4, 1),
                ymd(2024, 6, 1),
            ]),
            notes: "Départ en mission".to_string(),
        },
        ymd(2024, 1, 20),
    )?;
    for warning in &manual.warnings {
        println!("  ⚠️  {:?}", warning);
    }

    println!("\n📅 Running one sweep per night from January to August...");
    let mut night = ymd(2024, 1, 1);
    while night <= ymd(2024, 8, 31) {
        let report = engine.run_consumption(night, None);
        if report.months_consumed() > 0 {
            for sweep in report.plans.iter().filter(|s| s.consumed_any()) {
                if let Some(plan_id) = sweep.plan_id {
                    let months: Vec<String> =
                        sweep.consumed.iter().map(|m| french_month_label(*m)).collect();
                    println!("  {} {}: {}", night, plan_id, months.join(", "));
                }
            }
        }
        if report.summary.failed > 0 {
            println!("  ❌ {} plan(s) failed on {}", report.summary.failed, night);
        }
        night = night.succ_opt().unwrap();
    }

    let today = ymd(2024, 8, 31);

    println!("\n🔍 Verification");
    let issues = engine.verify();
    println!("  {} inconsistencies", issues.len());
    let findings = engine.audit(today);
    println!("  {} ledger findings", findings.len());

    println!("\n📈 Aggregate");
    println!("{}", serde_json::to_string_pretty(&engine.aggregate(today))?);

    println!("\n🔔 Alerts");
    for alert in engine.alerts(today) {
        println!("  {}", serde_json::to_string(&alert)?);
    }

    let due = amount_due_for_month(engine.book(), ContractId(1), ymd(2024, 9, 1))?;
    println!(
        "\n💶 September for contract 1: {} due ({} covered by advance)",
        due.amount_due, due.covered_by_advance
    );

    Ok(())
}
