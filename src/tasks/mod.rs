pub mod charger_manager_task;
