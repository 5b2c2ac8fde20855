use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_checkout_sessions_table::Migration),
            Box::new(m20250301_000002_create_outbound_publish_log_table::Migration),
            Box::new(m20250301_000003_create_sales_table::Migration),
            Box::new(m20250301_000004_create_terminal_webhook_log_table::Migration),
        ]
    }
}

mod m20250301_000001_create_checkout_sessions_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000001_create_checkout_sessions_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(CheckoutSessions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CheckoutSessions::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::InvoiceNumber)
                                .string_len(64)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::TxnId)
                                .string_len(64)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::Attempt)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::SliceIndex)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::SliceCount)
                                .integer()
                                .not_null()
                                .default(1),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::AmountCents)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::Status)
                                .string_len(32)
                                .not_null()
                                .default("pending"),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::StartedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::LastSeenAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::ResolvedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(CheckoutSessions::ResolvedBy)
                                .string_len(32)
                                .null(),
                        )
                        .col(ColumnDef::new(CheckoutSessions::WebhookJson).json().null())
                        .col(ColumnDef::new(CheckoutSessions::SaleId).uuid().null())
                        .col(
                            ColumnDef::new(CheckoutSessions::PosSnapshot)
                                .json()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .unique()
                        .name("uq_checkout_sessions_txn_id")
                        .table(CheckoutSessions::Table)
                        .col(CheckoutSessions::TxnId)
                        .to_owned(),
                )
                .await?;

            // Guards the sequencer and resend path against opening the same attempt twice
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .unique()
                        .name("uq_checkout_sessions_invoice_attempt")
                        .table(CheckoutSessions::Table)
                        .col(CheckoutSessions::InvoiceNumber)
                        .col(CheckoutSessions::Attempt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_checkout_sessions_status")
                        .table(CheckoutSessions::Table)
                        .col(CheckoutSessions::Status)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CheckoutSessions::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum CheckoutSessions {
        Table,
        Id,
        InvoiceNumber,
        TxnId,
        Attempt,
        SliceIndex,
        SliceCount,
        AmountCents,
        Status,
        StartedAt,
        LastSeenAt,
        ResolvedAt,
        ResolvedBy,
        WebhookJson,
        SaleId,
        PosSnapshot,
    }
}

mod m20250301_000002_create_outbound_publish_log_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000002_create_outbound_publish_log_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(OutboundPublishLog::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OutboundPublishLog::TxnId)
                                .string_len(64)
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OutboundPublishLog::InvoiceNumber)
                                .string_len(64)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OutboundPublishLog::Attempt)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OutboundPublishLog::Phase)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(ColumnDef::new(OutboundPublishLog::Payload).json().not_null())
                        .col(ColumnDef::new(OutboundPublishLog::AckText).text().null())
                        .col(ColumnDef::new(OutboundPublishLog::AckOk).boolean().null())
                        .col(
                            ColumnDef::new(OutboundPublishLog::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OutboundPublishLog::AckedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_outbound_publish_log_invoice")
                        .table(OutboundPublishLog::Table)
                        .col(OutboundPublishLog::InvoiceNumber)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OutboundPublishLog::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum OutboundPublishLog {
        Table,
        TxnId,
        InvoiceNumber,
        Attempt,
        Phase,
        Payload,
        AckText,
        AckOk,
        CreatedAt,
        AckedAt,
    }
}

mod m20250301_000003_create_sales_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000003_create_sales_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Sales::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Sales::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Sales::InvoiceNumber).string_len(64).not_null())
                        .col(ColumnDef::new(Sales::SubtotalCents).big_integer().not_null())
                        .col(ColumnDef::new(Sales::DiscountCents).big_integer().not_null())
                        .col(ColumnDef::new(Sales::TaxCents).big_integer().not_null())
                        .col(ColumnDef::new(Sales::TotalCents).big_integer().not_null())
                        .col(ColumnDef::new(Sales::PaymentMethod).text().not_null())
                        .col(ColumnDef::new(Sales::Items).json().not_null())
                        .col(ColumnDef::new(Sales::TenderParts).json().not_null())
                        .col(ColumnDef::new(Sales::FinalizedBy).string_len(32).not_null())
                        .col(
                            ColumnDef::new(Sales::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // One sale per invoice; concurrent finalizers race on this index
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .unique()
                        .name("uq_sales_invoice_number")
                        .table(Sales::Table)
                        .col(Sales::InvoiceNumber)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Sales::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Sales {
        Table,
        Id,
        InvoiceNumber,
        SubtotalCents,
        DiscountCents,
        TaxCents,
        TotalCents,
        PaymentMethod,
        Items,
        TenderParts,
        FinalizedBy,
        CreatedAt,
    }
}

mod m20250301_000004_create_terminal_webhook_log_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000004_create_terminal_webhook_log_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(TerminalWebhookLog::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(TerminalWebhookLog::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(TerminalWebhookLog::TxnId)
                                .string_len(64)
                                .null(),
                        )
                        .col(
                            ColumnDef::new(TerminalWebhookLog::InvoiceNumber)
                                .string_len(64)
                                .null(),
                        )
                        .col(ColumnDef::new(TerminalWebhookLog::VendorState).text().null())
                        .col(
                            ColumnDef::new(TerminalWebhookLog::NormalizedState)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(TerminalWebhookLog::SignatureValid)
                                .boolean()
                                .null(),
                        )
                        .col(ColumnDef::new(TerminalWebhookLog::Payload).json().not_null())
                        .col(
                            ColumnDef::new(TerminalWebhookLog::ReceivedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_terminal_webhook_log_txn_id")
                        .table(TerminalWebhookLog::Table)
                        .col(TerminalWebhookLog::TxnId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(TerminalWebhookLog::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum TerminalWebhookLog {
        Table,
        Id,
        TxnId,
        InvoiceNumber,
        VendorState,
        NormalizedState,
        SignatureValid,
        Payload,
        ReceivedAt,
    }
}
