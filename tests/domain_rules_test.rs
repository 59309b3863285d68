#[cfg(test)]
mod domain_rules_integration_tests {
    use chrono::{NaiveDate, Utc};
    use jobserver::jobs::lifecycle::{
        map_external_status, parse_quote_stamp, InstallStage, LifecyclePhase, SalesStage,
    };
    use jobserver::jobs::Job;
    use jobserver::scheduling::{
        apply_confirmed, apply_tentative, booked_hours, confirm_tentative,
        daily_install_capacity, is_over_capacity, unschedule, would_overbook, Milestone,
    };
    use jobserver::settings::{StaffMember, StaffRole};
    use jobserver::worktypes::reorder_indices;
    use uuid::Uuid;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn crew(n: usize, hours: f64) -> Vec<StaffMember> {
        (0..n)
            .map(|i| StaffMember {
                id: format!("crew-{}", i),
                name: format!("Crew {}", i),
                role: StaffRole::Install,
                daily_capacity_hours: hours,
                skills: vec![],
                active: true,
            })
            .collect()
    }

    fn work_order() -> Job {
        let mut job = Job::new_lead(Utc::now());
        job.lifecycle_phase = LifecyclePhase::WorkOrder.as_str().to_string();
        job.install_stage = Some(InstallStage::PendingPosts.as_str().to_string());
        job
    }

    #[test]
    fn quote_sent_elapsed_matches_the_dashboard_rules() {
        // Sent midnight local time, checked at 10:00 the same morning.
        let now = parse_quote_stamp("2024-01-01 10:00:00").unwrap();
        let derived = map_external_status("Quote", true, Some("2024-01-01 00:00:00"), now);
        assert_eq!(derived.hours_since_quote_sent, Some(10));
        assert_eq!(derived.days_since_quote_sent, None);
        assert_eq!(derived.sales_stage, Some(SalesStage::Fresh));

        // Past the 24h mark the hour counter goes away entirely.
        let now = parse_quote_stamp("2024-01-03 06:00:00").unwrap();
        let derived = map_external_status("Quote", true, Some("2024-01-01 00:00:00"), now);
        assert_eq!(derived.hours_since_quote_sent, None);
        assert_eq!(derived.days_since_quote_sent, Some(2));
    }

    #[test]
    fn full_install_flow_walks_the_stage_machine() {
        let today = date("2024-05-01");
        let mut job = work_order();

        // Pencil posts far out, then pull the date in and confirm it.
        apply_tentative(&mut job, Milestone::Posts, date("2024-06-20"), Utc::now()).unwrap();
        assert_eq!(job.install_stage.as_deref(), Some("tentative_posts"));
        assert!(confirm_tentative(&mut job, Milestone::Posts, today, Utc::now()).is_err());

        apply_tentative(&mut job, Milestone::Posts, date("2024-05-10"), Utc::now()).unwrap();
        confirm_tentative(&mut job, Milestone::Posts, today, Utc::now()).unwrap();
        assert_eq!(job.install_stage.as_deref(), Some("posts_scheduled"));
        assert_eq!(job.post_install_date, Some(date("2024-05-10")));
        assert_eq!(job.tentative_post_date, None);

        // Panels follow the same shape.
        apply_confirmed(&mut job, Milestone::Panels, date("2024-05-14"), today, Utc::now())
            .unwrap();
        assert_eq!(job.install_stage.as_deref(), Some("panels_scheduled"));

        // Dragging panels back to the queue resets to pending.
        assert!(unschedule(&mut job, Milestone::Panels, Utc::now()));
        assert_eq!(job.panel_install_date, None);
        assert_eq!(job.install_stage.as_deref(), Some("pending_panels"));
        assert!(!unschedule(&mut job, Milestone::Panels, Utc::now()));
    }

    #[test]
    fn capacity_check_distinguishes_overbooked_from_over_capacity() {
        let staff = crew(4, 8.0);
        let capacity = daily_install_capacity(&staff);
        assert_eq!(capacity, 32.0);

        let day = date("2024-05-10");
        let booked = booked_hours(&[], day);
        assert_eq!(booked, 0.0);
        assert!(would_overbook(booked, capacity, 40.0));
        assert!(!is_over_capacity(booked, capacity));

        let mut a = work_order();
        a.post_install_date = Some(day);
        a.post_duration_hours = Some(20.0);
        let mut b = work_order();
        b.panel_install_date = Some(day);
        b.panel_duration_hours = Some(14.0);
        let booked = booked_hours(&[a, b], day);
        assert_eq!(booked, 34.0);
        assert!(is_over_capacity(booked, capacity));
    }

    #[test]
    fn reorder_yields_contiguous_increasing_indices() {
        let ids: Vec<Uuid> = (0..7).map(|_| Uuid::new_v4()).collect();
        let mut shuffled = ids.clone();
        shuffled.reverse();
        shuffled.swap(1, 5);

        let assignments = reorder_indices(&ids, &shuffled).unwrap();
        let indices: Vec<i32> = assignments.iter().map(|(_, i)| *i).collect();
        assert_eq!(indices, (0..7).collect::<Vec<i32>>());
    }
}
