use axum::{extract::State, Json};
use bson::oid::ObjectId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use validator::Validate;

use crate::app::Environment;
use crate::error::Error;
use crate::sms::SmsClient;
use crate::util::{self, DecimalString, FormattedDateTime, ObjectIdString};
use crate::vision::{ImageCategory, VisionClient};

use super::otp;
use super::pricing::{self, Settlement};
use super::terminal::{find_available_locker, LockerSize, TerminalCollection, TerminalModel};
use super::token::{TerminalKey, UserSession};

/// A face match below this percentage does not open the locker. Kiosks
/// match on-device against the enrolled capture and hold it to this.
pub const ACCEPTABLE_MATCH_PERCENTAGE: f64 = 80.0;

const CLAIM_ATTEMPTS: usize = 3;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "canceled")]
    Canceled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
        }
    }

    /// The lifecycle only moves forward: pending orders start, in-progress
    /// orders finish, and either can be canceled. Terminal states stay put.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Canceled)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Canceled)
        )
    }
}

/// Wire casing for payment status is inconsistent across gateways, so
/// lowercase and uppercase spellings are accepted too.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    #[serde(alias = "approved", alias = "APPROVED")]
    Approved,
    #[serde(alias = "pending", alias = "PENDING")]
    Pending,
    #[serde(alias = "declined", alias = "DECLINED")]
    Declined,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub reference: Option<String>,
    pub paid_at: bson::DateTime,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderModel {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub terminal: ObjectId,
    pub locker_number: i32,
    pub locker_size: LockerSize,

    pub sender: ObjectId,
    pub receiver_name: Option<String>,
    pub receiver_mobile: String,

    pub status: OrderStatus,

    /// Receiver's enrolled face image file, when this is a face pickup.
    pub face_id: Option<String>,
    pub collect_pin: Option<String>,
    /// Confidence of the face match that opened the locker.
    pub match_percentage: Option<f64>,

    pub drop_image: Option<String>,
    pub pickup_image: Option<String>,

    pub base_price: Decimal,
    /// Running total billed for the locker, updated at collect time.
    pub locker_price: Decimal,
    #[serde(default)]
    pub payments: Vec<Payment>,

    pub dropped_at: Option<bson::DateTime>,
    pub collected_at: Option<bson::DateTime>,

    pub created_at: bson::DateTime,
    pub updated_at: bson::DateTime,
}

#[derive(Clone)]
pub struct OrderCollection(pub crate::mongo_ext::Collection<OrderModel>);

impl std::ops::Deref for OrderCollection {
    type Target = crate::mongo_ext::Collection<OrderModel>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Filter matching an in-progress order a receiver can collect at a
/// terminal. Pin and face checks are both scoped by this.
pub fn in_progress_filter(receiver_mobile: &str, terminal_id: ObjectId) -> bson::Document {
    bson::doc! {
        "receiverMobile": receiver_mobile,
        "terminal": terminal_id,
        "status": OrderStatus::InProgress.as_str(),
    }
}

/// Pin pickups match on the pin in the query itself, so a receiver with
/// several live orders at one terminal opens exactly the locker their
/// pin belongs to.
pub fn collect_pin_filter(
    receiver_mobile: &str,
    terminal_id: ObjectId,
    collect_pin: &str,
) -> bson::Document {
    let mut filter = in_progress_filter(receiver_mobile, terminal_id);
    filter.insert("collectPin", collect_pin);
    filter
}

impl OrderCollection {
    pub async fn find_in_progress(
        &self,
        receiver_mobile: &str,
        terminal_id: ObjectId,
    ) -> Result<Option<OrderModel>, Error> {
        self.find_one(in_progress_filter(receiver_mobile, terminal_id), None)
            .await
            .map_err(Into::into)
    }

    pub async fn find_in_progress_by_pin(
        &self,
        receiver_mobile: &str,
        terminal_id: ObjectId,
        collect_pin: &str,
    ) -> Result<Option<OrderModel>, Error> {
        self.find_one(
            collect_pin_filter(receiver_mobile, terminal_id, collect_pin),
            None,
        )
        .await
        .map_err(Into::into)
    }

    pub async fn find_active_for_sender(
        &self,
        sender: ObjectId,
        terminal_id: ObjectId,
    ) -> Result<Option<OrderModel>, Error> {
        self.find_one(
            bson::doc! {
                "sender": sender,
                "terminal": terminal_id,
                "status": {
                    "$in": [
                        OrderStatus::Pending.as_str(),
                        OrderStatus::InProgress.as_str(),
                    ]
                },
            },
            None,
        )
        .await
        .map_err(Into::into)
    }
}

/// Money still owed plus the already-settled parts, shaped for kiosks.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SettlementModel {
    pub hours: i64,
    pub base_price: DecimalString,
    pub additional_fee: DecimalString,
    pub total: DecimalString,
    pub paid: DecimalString,
    pub due: DecimalString,
}

impl From<Settlement> for SettlementModel {
    fn from(value: Settlement) -> Self {
        Self {
            hours: value.hours,
            base_price: value.base_price.into(),
            additional_fee: value.additional_fee.into(),
            total: value.total.into(),
            paid: value.paid.into(),
            due: value.due.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CollectCompletedResponse {
    pub message: String,
    pub code: String,
    pub order_id: ObjectIdString,
    pub locker_number: i32,
    pub settlement: SettlementModel,
    pub collected_at: FormattedDateTime,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredResponse {
    pub message: String,
    pub code: String,
    pub order_id: ObjectIdString,
    pub settlement: SettlementModel,
}

/// Collect endpoints either open the locker or ask for payment first.
#[derive(Serialize, Debug)]
#[serde(untagged)]
pub enum CollectResponse {
    Completed(CollectCompletedResponse),
    PaymentRequired(PaymentRequiredResponse),
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MatchFaceResponse {
    pub message: String,
    pub code: String,
    pub order_id: ObjectIdString,
    /// Stored reference of the face enrolled at shipment time.
    pub face_id: String,
    /// The enrolled capture, base64, for the kiosk to match against.
    pub face_image: String,
    pub acceptable_match_percentage: f64,
    pub settlement: SettlementModel,
}

/// Face collect hands the kiosk the enrolled capture to match against;
/// the kiosk then calls complete-order with the measured confidence.
#[derive(Serialize, Debug)]
#[serde(untagged)]
pub enum FaceCollectResponse {
    Matched(MatchFaceResponse),
    PaymentRequired(PaymentRequiredResponse),
}

/// Bills the order against the terminal's pricing table. Terminals
/// without a table only charge the base price.
pub fn settlement_for(
    terminal: &TerminalModel,
    order: &OrderModel,
    now: OffsetDateTime,
) -> Result<Settlement, Error> {
    let dropped_at: OffsetDateTime = order.dropped_at.unwrap_or(order.created_at).into();

    match terminal.price.as_ref() {
        Some(table) => pricing::settle(
            table,
            order.locker_size,
            order.base_price,
            dropped_at,
            now,
            &order.payments,
        ),
        None => {
            let paid = pricing::approved_payments_total(&order.payments);
            Ok(Settlement {
                hours: pricing::duration_in_hours(dropped_at, now),
                base_price: order.base_price,
                additional_fee: Decimal::ZERO,
                total: order.base_price,
                paid,
                due: pricing::due_balance(order.base_price, paid),
            })
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateShipmentRequest {
    pub receiver_mobile: Option<String>,
    pub receiver_name: Option<String>,
    pub locker_size: String,
    /// Caller-quoted base price. Falls back to the terminal's configured
    /// price when absent.
    pub locker_price: Option<DecimalString>,
    /// Receiver face image, base64. Required on face-enabled terminals.
    pub face_image: Option<String>,
    /// Caller-chosen pickup pin. Required on face-enabled terminals as
    /// the fallback challenge.
    pub collect_pin: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateShipmentResponse {
    pub order_id: ObjectIdString,
    pub locker_number: i32,
    pub size: LockerSize,
    pub base_price: DecimalString,
    pub face_pickup: bool,
}

/// Only face terminals hold a sender to one live order: the enrolled
/// face cannot tell two of their shipments apart. Pin pickups are
/// disambiguated by the pin itself, so several can run concurrently.
fn enforces_single_active_order(terminal: &TerminalModel) -> bool {
    terminal.face_enabled
}

/// Reserves a locker and opens a pending order. The locker flip and the
/// order insert commit together; losing a claim race retries with the
/// next free locker.
pub async fn create_shipment(
    terminal_key: TerminalKey,
    sender: UserSession,
    State(users): State<super::user::UserCollection>,
    State(terminals): State<TerminalCollection>,
    State(orders): State<OrderCollection>,
    State(vision): State<VisionClient>,
    State(mongo): State<mongodb::Client>,
    Json(request): Json<CreateShipmentRequest>,
) -> Result<Json<CreateShipmentResponse>, Error> {
    let size: LockerSize = request.locker_size.parse()?;

    let quoted_price = match request.locker_price {
        Some(price) => {
            let price = Decimal::from(price);
            if price.is_sign_negative() {
                return Err(Error::InvalidFields);
            }
            Some(price)
        }
        None => None,
    };

    let user = users
        .find_one_by_id(sender.id)
        .await?
        .ok_or(Error::UserNotFound)?;
    if !user.is_verified {
        return Err(Error::UserNotVerified);
    }

    let terminal = terminals
        .find_by_uuid(&terminal_key.0)
        .await?
        .ok_or(Error::TerminalNotFound)?;

    if enforces_single_active_order(&terminal)
        && orders
            .find_active_for_sender(sender.id, terminal.id)
            .await?
            .is_some()
    {
        return Err(Error::OrderInProgress);
    }

    let order_id = ObjectId::new();

    // Face terminals verify pickup with the enrolled face and keep the
    // sender-chosen pin as fallback. Non-face terminals text the receiver
    // a pin at drop-off instead.
    let (face_id, collect_pin, receiver_mobile) = if terminal.face_enabled {
        let image = request.face_image.as_deref().ok_or(Error::MissingFaceId)?;
        let pin = request
            .collect_pin
            .clone()
            .filter(|pin| !pin.is_empty())
            .ok_or(Error::MissingCollectPin)?;

        let stored = vision
            .upload_image(image, order_id, ImageCategory::Profile)
            .await?;

        let receiver = request
            .receiver_mobile
            .clone()
            .filter(|phone| !phone.is_empty())
            .unwrap_or_else(|| sender.phone.clone());

        (Some(stored.file_name), Some(pin), receiver)
    } else {
        let receiver = request
            .receiver_mobile
            .clone()
            .filter(|phone| !phone.is_empty())
            .ok_or(Error::MissingReceiverMobile)?;

        (None, None, receiver)
    };

    if !util::is_valid_phone(&receiver_mobile) {
        return Err(Error::InvalidPhoneNumber);
    }

    let mut terminal = terminal;
    for attempt in 0..CLAIM_ATTEMPTS {
        if attempt > 0 {
            terminal = terminals
                .find_one_by_id(terminal.id)
                .await?
                .ok_or(Error::TerminalNotFound)?;
        }

        let locker = find_available_locker(&terminal.lockers, size)?;
        let base_price = match quoted_price {
            Some(price) => price,
            None => pricing::base_price_for(&terminal, locker)?,
        };
        let locker_number = locker.locker_number;

        let mut db_session = mongo.start_session(None).await?;

        let transaction_options = mongodb::options::TransactionOptions::builder()
            .read_concern(mongodb::options::ReadConcern::snapshot())
            .write_concern(
                mongodb::options::WriteConcern::builder()
                    .w(mongodb::options::Acknowledgment::Majority)
                    .build(),
            )
            .selection_criteria(mongodb::options::SelectionCriteria::ReadPreference(
                mongodb::options::ReadPreference::Primary,
            ))
            .build();

        db_session.start_transaction(transaction_options).await?;

        let claimed = terminals
            .claim_locker(&mut db_session, terminal.id, locker_number)
            .await?;

        if !claimed {
            // someone else took this locker between the read and the write
            db_session.abort_transaction().await?;
            continue;
        }

        let now = bson::DateTime::now();
        let order = OrderModel {
            id: order_id,
            terminal: terminal.id,
            locker_number,
            locker_size: size,
            sender: sender.id,
            receiver_name: request.receiver_name.clone(),
            receiver_mobile: receiver_mobile.clone(),
            status: OrderStatus::Pending,
            face_id: face_id.clone(),
            collect_pin: collect_pin.clone(),
            match_percentage: None,
            drop_image: None,
            pickup_image: None,
            base_price,
            locker_price: base_price,
            payments: vec![],
            dropped_at: None,
            collected_at: None,
            created_at: now,
            updated_at: now,
        };

        orders
            .insert_one_with_session(&order, None, &mut db_session)
            .await?;

        db_session.commit_transaction().await?;

        return Ok(Json(CreateShipmentResponse {
            order_id: order.id.into(),
            locker_number,
            size,
            base_price: base_price.into(),
            face_pickup: order.face_id.is_some(),
        }));
    }

    Err(Error::LockerNotAvailable(size.as_str().to_string()))
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CompleteDropOffRequest {
    pub order_id: ObjectIdString,
    /// Photo of the package inside the locker, base64.
    pub drop_image: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CompleteDropOffResponse {
    pub message: String,
    pub order_id: ObjectIdString,
    pub locker_number: i32,
}

/// Confirms the package is in the locker. Moves the order in-progress
/// and, for non-face pickups, texts the receiver their collect pin.
pub async fn complete_drop_off(
    terminal_key: TerminalKey,
    State(terminals): State<TerminalCollection>,
    State(orders): State<OrderCollection>,
    State(vision): State<VisionClient>,
    State(sms): State<SmsClient>,
    State(env): State<Environment>,
    Json(request): Json<CompleteDropOffRequest>,
) -> Result<Json<CompleteDropOffResponse>, Error> {
    let terminal = terminals
        .find_by_uuid(&terminal_key.0)
        .await?
        .ok_or(Error::TerminalNotFound)?;

    let order = orders
        .find_one_by_id(request.order_id.0)
        .await?
        .filter(|order| order.terminal == terminal.id)
        .ok_or(Error::OrderNotFound)?;

    if !order.status.can_transition_to(OrderStatus::InProgress) {
        return Err(Error::OrderStatusInvalid(order.status.as_str().to_string()));
    }

    // the claimed locker must still exist on the terminal document
    if !terminal
        .lockers
        .iter()
        .any(|locker| locker.locker_number == order.locker_number)
    {
        return Err(Error::LockerNotFound);
    }

    let mut set = bson::doc! {
        "status": OrderStatus::InProgress.as_str(),
        "droppedAt": bson::DateTime::now(),
        "updatedAt": bson::DateTime::now(),
    };

    if let Some(image) = request.drop_image.as_deref() {
        let stored = vision
            .upload_image(image, order.id, ImageCategory::Drop)
            .await?;
        set.insert("dropImage", stored.file_name);
    }

    if order.face_id.is_none() && order.collect_pin.is_none() {
        let pin = otp::generate_collect_pin(env);
        sms.send_collect_pin_message(&order.receiver_mobile, &pin, order.locker_number)
            .await?;
        set.insert("collectPin", pin);
    }

    orders
        .update_one_by_id(order.id, bson::doc! { "$set": set })
        .await?;

    // claimed at creation; re-asserting is a no-op unless the terminal
    // document was fixed up by hand in between
    terminals
        .set_locker_status(
            terminal.id,
            order.locker_number,
            super::terminal::LockerStatus::InUse,
        )
        .await?;

    Ok(Json(CompleteDropOffResponse {
        message: format!(
            "Drop-off complete. Receiver {} has been notified.",
            util::mask_phone(&order.receiver_mobile)
        ),
        order_id: order.id.into(),
        locker_number: order.locker_number,
    }))
}

/// Finishes a fully paid pickup: the order completes, the pin is
/// retired and the locker goes back to Available.
async fn finalize_pickup(
    orders: &OrderCollection,
    terminals: &TerminalCollection,
    order: &OrderModel,
    settlement: Settlement,
    pickup_image: Option<String>,
    match_percentage: Option<f64>,
) -> Result<CollectCompletedResponse, Error> {
    let collected_at = bson::DateTime::now();

    let mut set = bson::doc! {
        "status": OrderStatus::Completed.as_str(),
        "collectedAt": collected_at,
        "lockerPrice": bson::to_bson(&settlement.total)?,
        "updatedAt": collected_at,
    };

    if let Some(file_name) = pickup_image {
        set.insert("pickupImage", file_name);
    }

    if let Some(confidence) = match_percentage {
        set.insert("matchPercentage", confidence);
    }

    orders
        .update_one_by_id(
            order.id,
            bson::doc! {
                "$set": set,
                "$unset": { "collectPin": "" },
            },
        )
        .await?;

    terminals
        .release_locker(order.terminal, order.locker_number)
        .await?;

    Ok(CollectCompletedResponse {
        message: "Locker opened. Please collect your package.".to_string(),
        code: "M01".to_string(),
        order_id: order.id.into(),
        locker_number: order.locker_number,
        settlement: settlement.into(),
        collected_at: bson::DateTime::now().into(),
    })
}

fn payment_required(order: &OrderModel, settlement: Settlement) -> PaymentRequiredResponse {
    PaymentRequiredResponse {
        message: "Payment required before the locker can open.".to_string(),
        code: "P01".to_string(),
        order_id: order.id.into(),
        settlement: settlement.into(),
    }
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CollectFaceIdRequest {
    #[validate(length(min = 1))]
    pub phone: String,
}

/// Face pickup: looks up the receiver's in-progress order and hands back
/// the face enrolled at shipment time, or quotes the balance first on
/// payment-at-drop terminals. Complete-order then opens and settles.
pub async fn collect_shipment_face_id(
    terminal_key: TerminalKey,
    State(users): State<super::user::UserCollection>,
    State(terminals): State<TerminalCollection>,
    State(orders): State<OrderCollection>,
    State(vision): State<VisionClient>,
    Json(request): Json<CollectFaceIdRequest>,
) -> Result<Json<FaceCollectResponse>, Error> {
    request.validate()?;

    if !util::is_valid_phone(&request.phone) {
        return Err(Error::InvalidPhoneNumber);
    }

    let terminal = terminals
        .find_by_uuid(&terminal_key.0)
        .await?
        .ok_or(Error::TerminalNotFound)?;

    users
        .find_by_phone(&request.phone)
        .await?
        .ok_or(Error::UserNotFound)?;

    let order = orders
        .find_in_progress(&request.phone, terminal.id)
        .await?
        .ok_or(Error::OrderNotFound)?;

    let enrolled = order.face_id.as_deref().ok_or(Error::MissingFaceId)?;

    let face_image = vision
        .download_image(enrolled, ImageCategory::Profile)
        .await?;

    let settlement = settlement_for(&terminal, &order, OffsetDateTime::now_utc())?;

    // payment-at-drop terminals reconcile overstay charges before the
    // kiosk is allowed to run the match
    if terminal.drop_payment_required {
        orders
            .update_one_by_id(
                order.id,
                bson::doc! {
                    "$set": {
                        "lockerPrice": bson::to_bson(&settlement.total)?,
                        "updatedAt": bson::DateTime::now(),
                    }
                },
            )
            .await?;

        if settlement.due > Decimal::ZERO {
            return Ok(Json(FaceCollectResponse::PaymentRequired(
                payment_required(&order, settlement),
            )));
        }
    }

    Ok(Json(FaceCollectResponse::Matched(MatchFaceResponse {
        message: "Match the enrolled face to collect.".to_string(),
        code: "M01".to_string(),
        order_id: order.id.into(),
        face_id: enrolled.to_string(),
        face_image,
        acceptable_match_percentage: ACCEPTABLE_MATCH_PERCENTAGE,
        settlement: settlement.into(),
    })))
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CollectPinRequest {
    #[validate(length(min = 1))]
    pub phone: String,
    pub collect_pin: Option<String>,
}

/// Pin pickup for orders without an enrolled face.
pub async fn collect_shipment_pin(
    terminal_key: TerminalKey,
    _session: UserSession,
    State(terminals): State<TerminalCollection>,
    State(orders): State<OrderCollection>,
    Json(request): Json<CollectPinRequest>,
) -> Result<Json<CollectResponse>, Error> {
    request.validate()?;

    let pin = request
        .collect_pin
        .as_deref()
        .filter(|pin| !pin.is_empty())
        .ok_or(Error::MissingCollectPin)?;

    let terminal = terminals
        .find_by_uuid(&terminal_key.0)
        .await?
        .ok_or(Error::TerminalNotFound)?;

    // distinguish "nothing to collect" from "wrong pin"
    orders
        .find_in_progress(&request.phone, terminal.id)
        .await?
        .ok_or(Error::OrderNotFound)?;

    let order = orders
        .find_in_progress_by_pin(&request.phone, terminal.id, pin)
        .await?
        .ok_or(Error::CollectPinNotMatch)?;

    let settlement = settlement_for(&terminal, &order, OffsetDateTime::now_utc())?;

    if terminal.drop_payment_required && settlement.due > Decimal::ZERO {
        orders
            .update_one_by_id(
                order.id,
                bson::doc! {
                    "$set": {
                        "lockerPrice": bson::to_bson(&settlement.total)?,
                        "updatedAt": bson::DateTime::now(),
                    }
                },
            )
            .await?;

        return Ok(Json(CollectResponse::PaymentRequired(payment_required(
            &order, settlement,
        ))));
    }

    let completed = finalize_pickup(&orders, &terminals, &order, settlement, None, None).await?;

    Ok(Json(CollectResponse::Completed(completed)))
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub amount: DecimalString,
    pub reference: Option<String>,
}

#[derive(Deserialize, Validate, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CompleteOrderRequest {
    pub order_id: ObjectIdString,
    pub payment: Option<PaymentRequest>,
    /// Kiosk capture of the person collecting, base64.
    pub pickup_image: Option<String>,
    /// Match confidence reported by the face challenge, when one ran.
    pub match_percentage: Option<f64>,
}

/// Settles an in-progress order after payment. Records the payment,
/// re-quotes the balance and completes the pickup once nothing is owed.
pub async fn complete_order(
    terminal_key: TerminalKey,
    State(terminals): State<TerminalCollection>,
    State(orders): State<OrderCollection>,
    State(vision): State<VisionClient>,
    Json(request): Json<CompleteOrderRequest>,
) -> Result<Json<CollectResponse>, Error> {
    let terminal = terminals
        .find_by_uuid(&terminal_key.0)
        .await?
        .ok_or(Error::TerminalNotFound)?;

    let order = orders
        .find_one_by_id(request.order_id.0)
        .await?
        .filter(|order| order.terminal == terminal.id)
        .ok_or(Error::OrderNotFound)?;

    if !order.status.can_transition_to(OrderStatus::Completed) {
        return Err(Error::OrderStatusInvalid(order.status.as_str().to_string()));
    }

    if !terminal
        .lockers
        .iter()
        .any(|locker| locker.locker_number == order.locker_number)
    {
        return Err(Error::LockerNotFound);
    }

    let mut order = order;
    if let Some(payment) = request.payment {
        let payment = Payment {
            amount: payment.amount.into(),
            status: PaymentStatus::Approved,
            reference: payment.reference,
            paid_at: bson::DateTime::now(),
        };

        orders
            .update_one_by_id(
                order.id,
                bson::doc! {
                    "$push": { "payments": bson::to_bson(&payment)? },
                    "$set": { "updatedAt": bson::DateTime::now() },
                },
            )
            .await?;

        order.payments.push(payment);
    }

    let settlement = settlement_for(&terminal, &order, OffsetDateTime::now_utc())?;

    if settlement.due > Decimal::ZERO {
        return Ok(Json(CollectResponse::PaymentRequired(payment_required(
            &order, settlement,
        ))));
    }

    let pickup_image = match request.pickup_image.as_deref() {
        Some(image) => Some(
            vision
                .upload_image(image, order.id, ImageCategory::Pickup)
                .await?
                .file_name,
        ),
        None => None,
    };

    let completed = finalize_pickup(
        &orders,
        &terminals,
        &order,
        settlement,
        pickup_image,
        request.match_percentage,
    )
    .await?;

    Ok(Json(CollectResponse::Completed(completed)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_only_moves_forward() {
        use OrderStatus::*;

        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Canceled));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Canceled));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(Canceled));
        assert!(!Canceled.can_transition_to(Pending));
    }

    #[test]
    fn status_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_value(OrderStatus::InProgress).unwrap(),
            serde_json::json!("in-progress")
        );
        assert_eq!(
            serde_json::from_value::<OrderStatus>(serde_json::json!("canceled")).unwrap(),
            OrderStatus::Canceled
        );
    }

    #[test]
    fn pin_lookup_is_scoped_to_receiver_terminal_and_status() {
        let terminal_id = ObjectId::new();
        let filter = in_progress_filter("+14155552671", terminal_id);

        assert_eq!(
            filter.get_str("receiverMobile").unwrap(),
            "+14155552671"
        );
        assert_eq!(filter.get_object_id("terminal").unwrap(), terminal_id);
        assert_eq!(filter.get_str("status").unwrap(), "in-progress");
    }

    #[test]
    fn pin_match_is_part_of_the_query() {
        let terminal_id = ObjectId::new();
        let filter = collect_pin_filter("+14155552671", terminal_id, "4321");

        assert_eq!(filter.get_str("collectPin").unwrap(), "4321");
        assert_eq!(filter.get_str("receiverMobile").unwrap(), "+14155552671");
        assert_eq!(filter.get_object_id("terminal").unwrap(), terminal_id);
        assert_eq!(filter.get_str("status").unwrap(), "in-progress");
    }

    fn order(status: OrderStatus) -> OrderModel {
        let now = bson::DateTime::now();
        OrderModel {
            id: ObjectId::new(),
            terminal: ObjectId::new(),
            locker_number: 3,
            locker_size: LockerSize::Small,
            sender: ObjectId::new(),
            receiver_name: None,
            receiver_mobile: "+14155552671".to_string(),
            status,
            face_id: None,
            collect_pin: Some("1234".to_string()),
            match_percentage: None,
            drop_image: None,
            pickup_image: None,
            base_price: Decimal::from(5),
            locker_price: Decimal::from(5),
            payments: vec![],
            dropped_at: Some(now),
            collected_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn terminal_without_pricing() -> TerminalModel {
        let now = bson::DateTime::now();
        TerminalModel {
            id: ObjectId::new(),
            uuid: "uuid".to_string(),
            name: "Depot".to_string(),
            address: Default::default(),
            latitude: None,
            longitude: None,
            face_enabled: false,
            drop_payment_required: true,
            is_active: true,
            lockers: vec![],
            base_price: Some(Decimal::from(5)),
            price: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn settlement_without_a_table_charges_base_only() {
        let terminal = terminal_without_pricing();
        let mut order = order(OrderStatus::InProgress);
        order.dropped_at = Some(bson::DateTime::from(
            OffsetDateTime::now_utc() - time::Duration::hours(7),
        ));

        let settlement =
            settlement_for(&terminal, &order, OffsetDateTime::now_utc()).unwrap();

        assert_eq!(settlement.additional_fee, Decimal::ZERO);
        assert_eq!(settlement.total, Decimal::from(5));
        assert_eq!(settlement.due, Decimal::from(5));
    }

    #[test]
    fn settlement_counts_approved_payments() {
        let terminal = terminal_without_pricing();
        let mut order = order(OrderStatus::InProgress);
        order.payments.push(Payment {
            amount: Decimal::from(5),
            status: PaymentStatus::Approved,
            reference: None,
            paid_at: bson::DateTime::now(),
        });

        let settlement =
            settlement_for(&terminal, &order, OffsetDateTime::now_utc()).unwrap();

        assert_eq!(settlement.due, Decimal::ZERO);
    }

    #[test]
    fn collect_responses_expose_their_codes() {
        let order = order(OrderStatus::InProgress);
        let terminal = terminal_without_pricing();
        let settlement =
            settlement_for(&terminal, &order, OffsetDateTime::now_utc()).unwrap();

        let response = CollectResponse::PaymentRequired(payment_required(&order, settlement));
        let value = serde_json::to_value(&response).unwrap();

        assert_eq!(value.get("code").unwrap(), "P01");
        assert!(value.get("settlement").unwrap().get("due").is_some());
    }

    #[test]
    fn only_face_terminals_limit_senders_to_one_order() {
        let mut terminal = terminal_without_pricing();
        assert!(!enforces_single_active_order(&terminal));

        terminal.face_enabled = true;
        assert!(enforces_single_active_order(&terminal));
    }

    #[test]
    fn match_face_response_hands_out_the_enrolled_capture() {
        let order = order(OrderStatus::InProgress);
        let terminal = terminal_without_pricing();
        let settlement =
            settlement_for(&terminal, &order, OffsetDateTime::now_utc()).unwrap();

        let response = FaceCollectResponse::Matched(MatchFaceResponse {
            message: "Match the enrolled face to collect.".to_string(),
            code: "M01".to_string(),
            order_id: order.id.into(),
            face_id: "abc.jpg".to_string(),
            face_image: "aGk=".to_string(),
            acceptable_match_percentage: ACCEPTABLE_MATCH_PERCENTAGE,
            settlement: settlement.into(),
        });
        let value = serde_json::to_value(&response).unwrap();

        assert_eq!(value.get("code").unwrap(), "M01");
        assert_eq!(value.get("faceId").unwrap(), "abc.jpg");
        assert_eq!(value.get("faceImage").unwrap(), "aGk=");
        assert_eq!(value.get("acceptableMatchPercentage").unwrap(), 80.0);
    }

    #[test]
    fn order_model_serializes_camel_case() {
        let order = order(OrderStatus::Pending);
        let value = serde_json::to_value(&order).unwrap();

        assert!(value.get("receiverMobile").is_some());
        assert!(value.get("lockerNumber").is_some());
        assert!(value.get("collectPin").is_some());
        assert!(value.get("receiver_mobile").is_none());
    }
}
